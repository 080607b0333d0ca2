//! Branch and instance naming.
//!
//! Branch names are built from an issue number, a target version and an
//! optional suffix using the configured `wording.branchFormat`, and parsed back
//! with `wording.branchRegex`. Any branch generated here parses back to the
//! same parts.
//!
//! ```
//! use mdk::branch::BranchNamer;
//!
//! let namer = BranchNamer::with_defaults().unwrap();
//! let branch = namer.generate("MDL-1234", "39", Some("fix"));
//! assert_eq!(branch, "MDL-1234-39-fix");
//!
//! let parsed = namer.parse(&branch).unwrap();
//! assert_eq!(parsed.issue, "1234");
//! assert_eq!(parsed.version, "39");
//! assert_eq!(parsed.suffix.as_deref(), Some("fix"));
//! ```

use regex::{Regex, RegexBuilder};

use crate::config::Config;
use crate::error::Result;

/// The version token of the development line.
pub const MAIN_BRANCH: &str = "main";

/// Older name of the development line, accepted wherever `main` is.
pub const LEGACY_MAIN_BRANCH: &str = "master";

pub const DEFAULT_BRANCH_FORMAT: &str = "MDL-{issue}-{version}";
pub const DEFAULT_BRANCH_SUFFIX_SEPARATOR: &str = "-";
pub const DEFAULT_BRANCH_REGEX: &str =
    r"^MDL-(?P<issue>[0-9]+)-(?P<version>[0-9]+|main|master)(-(?P<suffix>[a-zA-Z0-9_-]+))?$";

/// Parts recovered from a branch name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBranch {
    pub issue: String,
    pub version: String,
    pub suffix: Option<String>,
}

impl ParsedBranch {
    /// The tracker key, e.g. `MDL-1234`.
    pub fn issue_key(&self) -> String {
        format!("MDL-{}", self.issue)
    }
}

/// Generates and recognises issue branch names.
#[derive(Debug, Clone)]
pub struct BranchNamer {
    format: String,
    suffix_separator: String,
    regex: Regex,
}

impl BranchNamer {
    pub fn new(format: &str, suffix_separator: &str, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self {
            format: format.to_string(),
            suffix_separator: suffix_separator.to_string(),
            regex,
        })
    }

    /// The stock `MDL-<issue>-<version>[-<suffix>]` naming.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            DEFAULT_BRANCH_FORMAT,
            DEFAULT_BRANCH_SUFFIX_SEPARATOR,
            DEFAULT_BRANCH_REGEX,
        )
    }

    /// Build from the `wording.*` settings, falling back to the defaults.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config
                .get_str("wording.branchFormat")
                .unwrap_or(DEFAULT_BRANCH_FORMAT),
            config
                .get_str("wording.branchSuffixSeparator")
                .unwrap_or(DEFAULT_BRANCH_SUFFIX_SEPARATOR),
            config
                .get_str("wording.branchRegex")
                .unwrap_or(DEFAULT_BRANCH_REGEX),
        )
    }

    /// Build a branch name. An empty suffix is treated as no suffix.
    pub fn generate(&self, issue: &str, version: &str, suffix: Option<&str>) -> String {
        let issue = normalize_issue(issue);
        let version = normalize_version(version);
        let mut branch = self
            .format
            .replace("{issue}", &issue)
            .replace("%(issue)s", &issue)
            .replace("{version}", &version)
            .replace("%(version)s", &version);
        if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
            branch.push_str(&self.suffix_separator);
            branch.push_str(suffix);
        }
        branch
    }

    /// Recover the parts of a branch name, `None` when it does not match.
    pub fn parse(&self, branch: &str) -> Option<ParsedBranch> {
        let captures = self.regex.captures(branch)?;
        let issue = captures.name("issue")?.as_str().to_string();
        let version = captures.name("version")?.as_str().to_string();
        let suffix = captures
            .name("suffix")
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty());
        Some(ParsedBranch {
            issue,
            version,
            suffix,
        })
    }
}

/// Strip a leading `MDL` token and the dash or underscore after it: `MDL-1234` is `1234`.
pub fn normalize_issue(issue: &str) -> String {
    let issue = issue.trim();
    let rest = match issue.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("mdl") => &issue[3..],
        _ => return issue.to_string(),
    };
    rest.strip_prefix(['-', '_']).unwrap_or(rest).to_string()
}

/// `master` is reported as `main`; anything else is unchanged.
pub fn normalize_version(version: &str) -> String {
    if is_main(version) {
        MAIN_BRANCH.to_string()
    } else {
        version.to_string()
    }
}

/// Whether a version token designates the development line.
pub fn is_main(version: &str) -> bool {
    version.eq_ignore_ascii_case(MAIN_BRANCH) || version.eq_ignore_ascii_case(LEGACY_MAIN_BRANCH)
}

/// The maintenance branch of a version: `39` is `MOODLE_39_STABLE`, `main` stays `main`.
pub fn stable_branch(version: &str) -> String {
    if is_main(version) {
        return MAIN_BRANCH.to_string();
    }
    match version.parse::<u32>() {
        Ok(number) => format!("MOODLE_{}_STABLE", number),
        Err(_) => version.to_string(),
    }
}

/// Extract `MDL-1234` from the start of a commit message.
pub fn issue_from_commit_message(message: &str) -> Option<String> {
    let message = message.trim_start();
    let prefix = message.get(..3)?;
    if !prefix.eq_ignore_ascii_case("mdl") {
        return None;
    }
    let rest = message[3..].strip_prefix(['-', '_'])?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("MDL-{}", digits))
}

/// Generates instance identifiers such as `stable_39` or `integration_master_wip`.
#[derive(Debug, Clone)]
pub struct InstanceNamer {
    prefix_stable: String,
    prefix_integration: String,
    prefix_master: String,
    suffix_separator: String,
}

impl InstanceNamer {
    pub fn new(
        prefix_stable: &str,
        prefix_integration: &str,
        prefix_master: &str,
        suffix_separator: &str,
    ) -> Self {
        Self {
            prefix_stable: prefix_stable.to_string(),
            prefix_integration: prefix_integration.to_string(),
            prefix_master: prefix_master.to_string(),
            suffix_separator: suffix_separator.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self::new(
            config
                .get_str("wording.prefixStable")
                .unwrap_or(&defaults.prefix_stable),
            config
                .get_str("wording.prefixIntegration")
                .unwrap_or(&defaults.prefix_integration),
            config
                .get_str("wording.prefixMaster")
                .unwrap_or(&defaults.prefix_master),
            config
                .get_str("wording.suffixSeparator")
                .unwrap_or(&defaults.suffix_separator),
        )
    }

    /// An explicit identifier wins over the generated name (spaces become
    /// underscores); the suffix is appended either way.
    pub fn generate(
        &self,
        version: &str,
        integration: bool,
        suffix: Option<&str>,
        identifier: Option<&str>,
    ) -> String {
        let mut name = match identifier {
            Some(identifier) => identifier.replace(' ', "_"),
            None => {
                let version = if is_main(version) {
                    self.prefix_master.as_str()
                } else {
                    version
                };
                let prefix = if integration {
                    &self.prefix_integration
                } else {
                    &self.prefix_stable
                };
                format!("{}{}", prefix, version)
            }
        };
        if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
            name.push_str(&self.suffix_separator);
            name.push_str(suffix);
        }
        name
    }
}

impl Default for InstanceNamer {
    fn default() -> Self {
        Self::new("stable_", "integration_", "master", "_")
    }
}
