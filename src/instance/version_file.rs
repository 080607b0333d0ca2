//! Reader for the product's `version.php`.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Marker string identifying the product's version file.
pub const VERSION_MARKER: &str = "MOODLE VERSION INFORMATION";

pub const VERSION_FILE: &str = "version.php";

/// Fields of `version.php`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionInfo {
    pub version: Option<String>,
    pub release: Option<String>,
    /// Lower-cased, without the `MATURITY_` prefix: `stable`, `beta`, ...
    pub maturity: Option<String>,
    /// The numeric branch, e.g. `405`. Derived from the release when absent.
    pub branch: Option<String>,
}

impl VersionInfo {
    pub fn read(code_dir: &Path) -> Result<Self> {
        let path = code_dir.join(VERSION_FILE);
        let content = fs::read_to_string(&path).map_err(|e| Error::NotAnInstance {
            path: code_dir.display().to_string(),
            reason: format!("cannot read {}: {}", VERSION_FILE, e),
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut info = VersionInfo::default();
        for line in content.lines() {
            let Some((name, value)) = assignment(line) else {
                continue;
            };
            match name {
                "version" => info.version = Some(value),
                "release" => info.release = Some(value),
                "maturity" => {
                    let value = value.strip_prefix("MATURITY_").unwrap_or(&value);
                    info.maturity = Some(value.to_ascii_lowercase());
                }
                "branch" => info.branch = Some(value),
                _ => {}
            }
        }
        if info.branch.is_none() {
            info.branch = info.release.as_deref().and_then(branch_from_release);
        }
        info
    }
}

/// `$name = value;` with surrounding quotes removed from the value.
fn assignment(line: &str) -> Option<(&str, String)> {
    let rest = line.trim_start().strip_prefix('$')?;
    let (name, value) = rest.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let value = value.split(';').next()?.trim();
    let value = value.trim_matches(|c| c == '\'' || c == '"');
    Some((name, value.to_string()))
}

/// `4.5.1+ (Build: ...)` gives `45`; older three-digit branches are not recoverable this way.
fn branch_from_release(release: &str) -> Option<String> {
    let digits: String = release
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| *c != '.')
        .take_while(char::is_ascii_digit)
        .take(2)
        .collect();
    if digits.len() == 2 {
        Some(digits)
    } else {
        None
    }
}

/// Whether `code_dir` holds a version file carrying the product marker.
pub fn is_instance_dir(code_dir: &Path) -> bool {
    fs::read_to_string(code_dir.join(VERSION_FILE))
        .map(|content| content.contains(VERSION_MARKER))
        .unwrap_or(false)
}
