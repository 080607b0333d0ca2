//! # Instances
//!
//! An [`Instance`] is one local working copy of the product: a code directory
//! holding a git checkout, a data directory, and once installed a database and
//! a `config.php`.
//!
//! Everything known about an instance is derived from disk by
//! [`Instance::reload`]: the branch from `version.php`, the installed flag and
//! settings from `config.php`, the integration flag from the upstream remote.
//! Nothing is cached between two loads, so the state never disagrees with
//! the files it was read from.
//!
//! ## Stash cycle
//!
//! Operations that need the stable branch checked out (update, upgrade) go
//! through [`Instance::checkout_stable`], which stashes local changes and
//! returns a [`StableCheckout`] guard. [`Instance::restore_branch`] consumes
//! the guard, switching back and popping the stash only if something was
//! stashed.

pub mod site_config;
pub mod version_file;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::branch::{self, BranchNamer};
use crate::config::Config;
use crate::database::{DatabaseProfile, DatabaseServer, Engine};
use crate::error::{Error, Result};
use crate::git::{GitOperations, StashOutcome};
use crate::process::{CommandOutput, CommandSpec, Runner};
use crate::scripts::ScriptLibrary;

pub use site_config::{ConfigValue, SiteConfig};
pub use version_file::{is_instance_dir, VersionInfo};

/// Database names are truncated to this length.
pub const DB_NAME_MAX_LENGTH: usize = 28;

/// First branch shipping `admin/cli/upgrade.php`.
pub const UPGRADE_MIN_BRANCH: u32 = 20;

/// First branch shipping `admin/cli/purge_caches.php`.
pub const PURGE_MIN_BRANCH: u32 = 22;

/// Presence of this file in the code directory forbids upgrades.
pub const NO_UPGRADE_MARKER: &str = ".noupgrade";

/// The remote URL of integration repositories ends with this.
pub const INTEGRATION_REMOTE_SUFFIX: &str = "integration.git";

/// Cache directories removed from the dataroot by a manual purge.
const CACHE_DIRS: &[&str] = &["cache", "localcache"];

/// The branch an instance is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchVersion {
    Numbered(u32),
    /// The development line, at or past the configured `masterBranch`.
    Main,
}

impl BranchVersion {
    /// Classify a `version.php` branch number against the main threshold.
    pub fn from_number(number: u32, master_branch: u32) -> Self {
        if number >= master_branch {
            BranchVersion::Main
        } else {
            BranchVersion::Numbered(number)
        }
    }

    pub fn stable_branch(&self) -> String {
        branch::stable_branch(&self.to_string())
    }

    pub fn compare(&self, other: u32) -> Ordering {
        match self {
            BranchVersion::Main => Ordering::Greater,
            BranchVersion::Numbered(n) => n.cmp(&other),
        }
    }
}

impl fmt::Display for BranchVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchVersion::Numbered(n) => write!(f, "{}", n),
            BranchVersion::Main => f.write_str(branch::MAIN_BRANCH),
        }
    }
}

/// Settings an instance reads from the global configuration.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub php: String,
    pub git: String,
    pub master_branch: u32,
    pub upstream_remote: String,
    pub my_remote: String,
    pub namer: BranchNamer,
    /// Web path prefix under which instances are served (`path` setting).
    pub url_path: String,
    pub force_cfg: BTreeMap<String, Value>,
    pub admin_login: String,
    pub admin_password: String,
    pub db_name_prefix: String,
}

impl InstanceSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let force_cfg = match config.get("forceCfg") {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            php: config.get_str("php").unwrap_or("php").to_string(),
            git: config.get_str("git").unwrap_or("git").to_string(),
            master_branch: config
                .get_u64("masterBranch")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(501),
            upstream_remote: config
                .get_str("upstreamRemote")
                .unwrap_or("stable")
                .to_string(),
            my_remote: config.get_str("myRemote").unwrap_or("github").to_string(),
            namer: BranchNamer::from_config(config)?,
            url_path: config
                .get_str("path")
                .unwrap_or("")
                .trim_matches('/')
                .to_string(),
            force_cfg,
            admin_login: config.get_str("login").unwrap_or("admin").to_string(),
            admin_password: config.get_str("passwd").unwrap_or("test").to_string(),
            db_name_prefix: config.get_str("db.namePrefix").unwrap_or("").to_string(),
        })
    }
}

/// Facts derived from the instance's files.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub version: VersionInfo,
    pub branch: BranchVersion,
    pub stable_branch: String,
    pub integration: bool,
    pub installed: bool,
    pub config: BTreeMap<String, ConfigValue>,
}

/// Proof that [`Instance::checkout_stable`] switched branches, to hand back
/// to [`Instance::restore_branch`].
#[must_use = "the previous branch and stash must be restored with Instance::restore_branch"]
#[derive(Debug)]
pub struct StableCheckout {
    previous: String,
    stashed: bool,
}

impl StableCheckout {
    pub fn stashed(&self) -> bool {
        self.stashed
    }

    pub fn previous(&self) -> &str {
        &self.previous
    }
}

/// Parameters of [`Instance::install`].
pub struct InstallOptions<'a> {
    pub db: &'a dyn DatabaseServer,
    pub profile: &'a DatabaseProfile,
    /// Defaults to [`default_db_name`].
    pub db_name: Option<String>,
    /// Defaults to the instance's data directory.
    pub data_dir: Option<PathBuf>,
    /// Defaults to [`default_full_name`].
    pub full_name: Option<String>,
    pub drop_db: bool,
    pub wwwroot: String,
}

/// One local working copy.
pub struct Instance {
    identifier: String,
    path: PathBuf,
    data_dir: PathBuf,
    settings: InstanceSettings,
    git: Box<dyn GitOperations>,
    runner: Box<dyn Runner>,
    state: InstanceState,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("identifier", &self.identifier)
            .field("path", &self.path)
            .field("state", &self.state)
            .finish()
    }
}

impl Instance {
    /// Load the instance whose code lives in `path`.
    pub fn load(
        identifier: impl Into<String>,
        path: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        settings: InstanceSettings,
        git: Box<dyn GitOperations>,
        runner: Box<dyn Runner>,
    ) -> Result<Self> {
        let path = path.into();
        if !is_instance_dir(&path) {
            return Err(Error::NotAnInstance {
                path: path.display().to_string(),
                reason: format!("no {} marker found", version_file::VERSION_FILE),
            });
        }
        let state = derive_state(&path, &settings, git.as_ref())?;
        Ok(Self {
            identifier: identifier.into(),
            path,
            data_dir: data_dir.into(),
            settings,
            git,
            runner,
            state,
        })
    }

    /// Re-derive the state from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.state = derive_state(&self.path, &self.settings, self.git.as_ref())?;
        Ok(())
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The code directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn git(&self) -> &dyn GitOperations {
        self.git.as_ref()
    }

    pub fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }

    pub fn is_installed(&self) -> bool {
        self.state.installed
    }

    pub fn is_integration(&self) -> bool {
        self.state.integration
    }

    pub fn is_stable(&self) -> bool {
        !self.state.integration
    }

    pub fn branch(&self) -> BranchVersion {
        self.state.branch
    }

    pub fn stable_branch(&self) -> &str {
        &self.state.stable_branch
    }

    /// Compare this instance's branch with a numbered branch; `main` is greater.
    pub fn branch_compare(&self, other: u32) -> Ordering {
        self.state.branch.compare(other)
    }

    /// `upstream/stable` for this instance's upstream remote.
    pub fn upstream_stable_ref(&self) -> String {
        format!("{}/{}", self.settings.upstream_remote, self.state.stable_branch)
    }

    pub fn current_branch(&self) -> Result<String> {
        self.git.current_branch()
    }

    /// A branch name for `issue`, defaulting the version to this instance's branch.
    pub fn generate_branch_name(
        &self,
        issue: &str,
        suffix: Option<&str>,
        version: Option<&str>,
    ) -> String {
        let own = self.state.branch.to_string();
        self.settings
            .namer
            .generate(issue, version.unwrap_or(&own), suffix)
    }

    /// Check out the branch of `issue`, creating it on top of the upstream
    /// stable branch when it does not exist yet. Returns the branch name.
    pub fn checkout_issue_branch(&self, issue: &str, suffix: Option<&str>) -> Result<String> {
        let branch = self.generate_branch_name(issue, suffix, None);
        if !self.git.has_branch(&branch, None)? {
            let track = self.upstream_stable_ref();
            log::info!("Creating branch {} tracking {}", branch, track);
            self.git.create_branch(&branch, Some(&track))?;
        }
        self.git.checkout(&branch)?;
        log::info!("Branch {} checked out", branch);
        Ok(branch)
    }

    /// A setting from `config.php`.
    pub fn config_value(&self, name: &str) -> Option<&ConfigValue> {
        self.state.config.get(name)
    }

    /// The engine named by the installed `dbtype` setting.
    pub fn db_engine(&self) -> Result<Engine> {
        match self.config_value("dbtype") {
            Some(ConfigValue::Str(dbtype)) => dbtype.parse(),
            _ => Err(Error::NotInstalled {
                identifier: self.identifier.clone(),
            }),
        }
    }

    /// Stash local changes (untracked included) and check out the stable branch.
    pub fn checkout_stable(&self) -> Result<StableCheckout> {
        let previous = self.current_branch()?;
        let stashed = self.git.stash_save(true)? == StashOutcome::Stashed;
        let guard = StableCheckout { previous, stashed };
        if guard.previous != self.state.stable_branch {
            if let Err(e) = self.git.checkout(&self.state.stable_branch) {
                if let Err(pop) = self.restore_branch(guard) {
                    log::warn!("{}", pop);
                }
                return Err(e);
            }
        }
        Ok(guard)
    }

    /// Return to the branch recorded by [`checkout_stable`](Self::checkout_stable)
    /// and pop the stash if one was made.
    pub fn restore_branch(&self, guard: StableCheckout) -> Result<()> {
        if self.current_branch()? != guard.previous {
            self.git.checkout(&guard.previous)?;
        }
        if guard.stashed {
            self.git.stash_pop().map_err(|e| {
                log::warn!("Your local changes are still in the stash of {}", self.identifier);
                e
            })?;
        }
        Ok(())
    }

    /// Fetch `remote` and hard reset the stable branch to it.
    pub fn update(&mut self, remote: Option<&str>) -> Result<()> {
        let remote = remote
            .unwrap_or(&self.settings.upstream_remote)
            .to_string();
        log::info!("Updating {} from {}", self.identifier, remote);
        self.git.fetch(&remote, None)?;

        let guard = self.checkout_stable()?;
        let upstream = format!("{}/{}", remote, self.state.stable_branch);
        if let Err(e) = self.git.reset(&upstream, true) {
            if let Err(restore) = self.restore_branch(guard) {
                log::warn!("{}", restore);
            }
            return Err(e);
        }
        self.restore_branch(guard)?;
        self.reload()
    }

    /// Run the upgrade tool on the stable branch.
    pub fn upgrade(&mut self, skip_checkout: bool) -> Result<()> {
        if !self.is_installed() {
            return Err(Error::NotInstalled {
                identifier: self.identifier.clone(),
            });
        }
        if self.branch_compare(UPGRADE_MIN_BRANCH) == Ordering::Less {
            return Err(Error::Unsupported {
                identifier: self.identifier.clone(),
                message: "the upgrade command line tool is not available in this version"
                    .to_string(),
            });
        }
        if self.path.join(NO_UPGRADE_MARKER).exists() {
            return Err(Error::UpgradeNotAllowed {
                identifier: self.identifier.clone(),
                reason: format!("{} file found", NO_UPGRADE_MARKER),
            });
        }

        let guard = if skip_checkout {
            None
        } else {
            Some(self.checkout_stable()?)
        };
        log::info!("Upgrading {}", self.identifier);
        let result = self.php(
            "admin/cli/upgrade.php",
            &["--non-interactive", "--allow-unstable"],
            true,
        );
        if let Some(guard) = guard {
            self.restore_branch(guard)?;
        }
        let output = result?;
        if !output.success() {
            return Err(Error::UpgradeFailed {
                identifier: self.identifier.clone(),
                message: format!("upgrade script exited with code {}", output.code),
            });
        }
        self.reload()
    }

    /// Purge caches, optionally deleting cache directories first.
    pub fn purge(&self, manual: bool) -> Result<()> {
        if !self.is_installed() {
            return Err(Error::NotInstalled {
                identifier: self.identifier.clone(),
            });
        }
        if self.branch_compare(PURGE_MIN_BRANCH) == Ordering::Less {
            return Err(Error::Unsupported {
                identifier: self.identifier.clone(),
                message: "the purge caches command line tool is not available in this version"
                    .to_string(),
            });
        }
        if manual {
            for dir in CACHE_DIRS {
                let dir = self.data_dir.join(dir);
                if dir.is_dir() {
                    log::debug!("Removing {}", dir.display());
                    fs::remove_dir_all(&dir)?;
                }
            }
        }
        let output = self.php("admin/cli/purge_caches.php", &[], false)?;
        if !output.success() {
            return Err(Error::Process {
                command: "admin/cli/purge_caches.php".to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Create the database and run the product's installer.
    pub fn install(&mut self, options: InstallOptions<'_>) -> Result<()> {
        if self.is_installed() {
            return Err(Error::AlreadyInstalled {
                identifier: self.identifier.clone(),
            });
        }
        if options.wwwroot.is_empty() {
            return Err(Error::InstallFailed {
                message: "the web root URL is empty".to_string(),
                command: None,
            });
        }
        let data_dir = options.data_dir.unwrap_or_else(|| self.data_dir.clone());
        if !data_dir.is_dir() {
            return Err(Error::InstallFailed {
                message: format!("data directory {} does not exist", data_dir.display()),
                command: None,
            });
        }

        let engine = options.profile.engine;
        let db_name = options
            .db_name
            .unwrap_or_else(|| default_db_name(&self.identifier, &self.settings.db_name_prefix));
        if options.db.exists(&db_name)? {
            if !options.drop_db {
                return Err(Error::AlreadyExists {
                    kind: "Database".to_string(),
                    name: db_name,
                });
            }
            log::info!("Dropping database {}", db_name);
            options.db.drop_database(&db_name)?;
        }
        log::info!("Creating database {}", db_name);
        options.db.create(&db_name)?;

        let full_name = options
            .full_name
            .unwrap_or_else(|| default_full_name(&self.identifier, engine));
        let dataroot = self
            .runner
            .dataroot()
            .map(Path::to_path_buf)
            .unwrap_or(data_dir);

        let profile = options.profile;
        let mut args = vec![
            format!("--wwwroot={}", options.wwwroot),
            format!("--dataroot={}", dataroot.display()),
            format!("--dbtype={}", engine),
            format!("--dbname={}", db_name),
            format!("--dbuser={}", profile.user),
            format!("--dbpass={}", profile.passwd),
            format!("--dbhost={}", profile.host),
        ];
        if let Some(port) = &profile.port {
            args.push(format!("--dbport={}", port));
        }
        args.extend([
            format!("--fullname={}", full_name),
            format!("--shortname={}", self.identifier),
            format!("--adminuser={}", self.settings.admin_login),
            format!("--adminpass={}", self.settings.admin_password),
            "--allow-unstable".to_string(),
            "--agree-license".to_string(),
            "--non-interactive".to_string(),
        ]);

        log::info!("Installing {}", self.identifier);
        let spec = self.php_spec("admin/cli/install.php", &args).inherit_output();
        let output = self.runner.exec(&spec)?;
        if !output.success() {
            return Err(Error::InstallFailed {
                message: format!("installer exited with code {}", output.code),
                command: Some(spec.to_string()),
            });
        }

        let config_file = self.path.join(site_config::CONFIG_FILE);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if config_file.is_file() {
                let mode = fs::Permissions::from_mode(0o666);
                if let Err(e) = fs::set_permissions(&config_file, mode) {
                    log::warn!("Could not change the mode of {}: {}", config_file.display(), e);
                }
            }
        }
        self.reload()?;

        let cookie_path = if self.settings.url_path.is_empty() {
            format!("/{}/", self.identifier)
        } else {
            format!("/{}/{}/", self.settings.url_path, self.identifier)
        };
        let mut extra = vec![("sessioncookiepath".to_string(), ConfigValue::Str(cookie_path))];
        extra.extend(
            self.settings
                .force_cfg
                .iter()
                .map(|(k, v)| (k.clone(), ConfigValue::from_json(v))),
        );
        for (name, value) in extra {
            if let Err(e) = self.add_config(&name, &value) {
                log::warn!("Could not set {} in {}: {}", name, config_file.display(), e);
            }
        }
        Ok(())
    }

    /// Drop the database, empty the data directory and remove `config.php`.
    pub fn uninstall(&mut self, db: &dyn DatabaseServer) -> Result<()> {
        if !self.is_installed() {
            return Err(Error::NotInstalled {
                identifier: self.identifier.clone(),
            });
        }
        if let Some(ConfigValue::Str(db_name)) = self.config_value("dbname") {
            if db.exists(db_name)? {
                log::info!("Dropping database {}", db_name);
                db.drop_database(db_name)?;
            }
        }
        if self.data_dir.is_dir() {
            log::info!("Emptying {}", self.data_dir.display());
            fs::remove_dir_all(&self.data_dir)?;
        }
        fs::create_dir_all(&self.data_dir)?;
        fs::remove_file(self.path.join(site_config::CONFIG_FILE))?;
        self.reload()
    }

    fn site_config(&self) -> Result<SiteConfig> {
        SiteConfig::read(&self.path)?.ok_or_else(|| Error::NotInstalled {
            identifier: self.identifier.clone(),
        })
    }

    pub fn add_config(&mut self, name: &str, value: &ConfigValue) -> Result<()> {
        let mut config = self.site_config()?;
        config.add(name, value)?;
        config.write()?;
        self.reload()
    }

    /// Remove a setting; returns whether it was present.
    pub fn remove_config(&mut self, name: &str) -> Result<bool> {
        let mut config = self.site_config()?;
        let removed = config.remove(name);
        if removed {
            config.write()?;
            self.reload()?;
        }
        Ok(removed)
    }

    pub fn update_config(&mut self, name: &str, value: &ConfigValue) -> Result<()> {
        let mut config = self.site_config()?;
        config.update(name, value)?;
        config.write()?;
        self.reload()
    }

    fn php_spec(&self, script: &str, args: &[String]) -> CommandSpec {
        CommandSpec::new(&self.settings.php)
            .arg(script)
            .args(args.iter().cloned())
            .cwd(&self.path)
    }

    fn php(&self, script: &str, args: &[&str], inherit: bool) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run_cli(script, &args, inherit)
    }

    /// Run a PHP command line script relative to the code directory.
    pub fn run_cli(&self, script: &str, args: &[String], inherit: bool) -> Result<CommandOutput> {
        if !self.path.join(script).is_file() {
            return Err(Error::ScriptNotFound {
                name: script.to_string(),
            });
        }
        let mut spec = self.php_spec(script, args);
        if inherit {
            spec = spec.inherit_output();
        }
        self.runner.exec(&spec)
    }

    /// Run a named helper script from `library` in this instance.
    pub fn run_script(
        &self,
        library: &ScriptLibrary,
        name: &str,
        args: &[String],
    ) -> Result<CommandOutput> {
        library.run(name, &self.path, args, self.runner.as_ref(), &self.settings.php)
    }

    /// The most recent commit of `branch`, defaulting to the upstream stable branch.
    pub fn head_commit(&self, branch: Option<&str>) -> Result<String> {
        let reference = branch
            .map(str::to_string)
            .unwrap_or_else(|| self.upstream_stable_ref());
        self.git
            .hashes(&reference, Some(1))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::GitCommand {
                command: format!("git log -n 1 {}", reference),
                stderr: "no commit found".to_string(),
            })
    }

    /// Derived facts and installed settings, as displayed by `mdk info`.
    pub fn info(&self) -> BTreeMap<String, String> {
        let mut info: BTreeMap<String, String> = self
            .state
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        let state = &self.state;
        let derived = [
            ("identifier", self.identifier.clone()),
            ("path", self.path.display().to_string()),
            ("branch", state.branch.to_string()),
            ("stablebranch", state.stable_branch.clone()),
            ("installed", state.installed.to_string()),
            ("integration", state.integration.to_string()),
            ("version", state.version.version.clone().unwrap_or_default()),
            ("release", state.version.release.clone().unwrap_or_default()),
            ("maturity", state.version.maturity.clone().unwrap_or_default()),
        ];
        for (key, value) in derived {
            info.insert(key.to_string(), value);
        }
        info
    }
}

fn derive_state(
    path: &Path,
    settings: &InstanceSettings,
    git: &dyn GitOperations,
) -> Result<InstanceState> {
    let version = VersionInfo::read(path)?;
    let number = version
        .branch
        .as_deref()
        .and_then(|b| b.parse::<u32>().ok())
        .ok_or_else(|| Error::NotAnInstance {
            path: path.display().to_string(),
            reason: "cannot determine the branch from version.php".to_string(),
        })?;
    let branch = BranchVersion::from_number(number, settings.master_branch);

    let site = SiteConfig::read(path)?;
    let integration = match git.get_remote(&settings.upstream_remote) {
        Ok(Some(url)) => url.ends_with(INTEGRATION_REMOTE_SUFFIX),
        Ok(None) => matches!(
            git.get_remote("origin"),
            Ok(Some(url)) if url.ends_with(INTEGRATION_REMOTE_SUFFIX)
        ),
        Err(e) => {
            log::debug!("Cannot read remotes of {}: {}", path.display(), e);
            false
        }
    };

    Ok(InstanceState {
        stable_branch: branch.stable_branch(),
        branch,
        version,
        integration,
        installed: site.is_some(),
        config: site.map(|s| s.values()).unwrap_or_default(),
    })
}

/// Alphanumeric, lower-cased, prefixed and truncated to [`DB_NAME_MAX_LENGTH`].
pub fn default_db_name(identifier: &str, prefix: &str) -> String {
    let prefix = prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_');
    let name = identifier
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase());
    prefix.chain(name).take(DB_NAME_MAX_LENGTH).collect()
}

/// `stable_main` on pgsql is `Stable Main PostgreSQL`.
pub fn default_full_name(identifier: &str, engine: Engine) -> String {
    let words: Vec<String> = identifier
        .split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{} {}", words.join(" "), engine.wording())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        create_instance_dirs, installed_site_config, MockDatabase, MockGit, MockRunner,
    };
    use serde_json::json;
    use tempfile::TempDir;

    fn settings() -> InstanceSettings {
        InstanceSettings::from_config(&Config::from_value(json!({
            "php": "php",
            "masterBranch": 501,
            "upstreamRemote": "stable",
            "path": "",
            "login": "admin",
            "passwd": "test",
            "forceCfg": {"debug": 32767}
        })))
        .unwrap()
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        git: MockGit,
        runner: MockRunner,
    }

    impl Fixture {
        fn new(branch: &str) -> Self {
            let temp = TempDir::new().unwrap();
            let root = create_instance_dirs(temp.path(), "stable_main", branch);
            let stable = branch::stable_branch(if branch == "501" { "main" } else { branch });
            Self {
                _temp: temp,
                root,
                git: MockGit::on_branch(&stable),
                runner: MockRunner::new(),
            }
        }

        fn code(&self) -> PathBuf {
            self.root.join("moodle")
        }

        fn install_config(&self) {
            fs::write(
                self.code().join("config.php"),
                installed_site_config("stablemain", &self.root.join("moodledata")),
            )
            .unwrap();
        }

        fn instance(&self) -> Instance {
            Instance::load(
                "stable_main",
                self.code(),
                self.root.join("moodledata"),
                settings(),
                Box::new(self.git.clone()),
                Box::new(self.runner.clone()),
            )
            .unwrap()
        }
    }

    fn profile() -> DatabaseProfile {
        DatabaseProfile {
            engine: Engine::PgSql,
            host: "localhost".to_string(),
            port: None,
            user: "postgres".to_string(),
            passwd: "pg".to_string(),
            container: None,
        }
    }

    #[test]
    fn test_load_derives_branch() {
        let fixture = Fixture::new("405");
        let instance = fixture.instance();
        assert_eq!(instance.branch(), BranchVersion::Numbered(405));
        assert_eq!(instance.stable_branch(), "MOODLE_405_STABLE");
        assert!(!instance.is_installed());
        assert!(instance.is_stable());
        assert_eq!(instance.branch_compare(22), Ordering::Greater);
    }

    #[test]
    fn test_branch_at_threshold_is_main() {
        let fixture = Fixture::new("501");
        let instance = fixture.instance();
        assert_eq!(instance.branch(), BranchVersion::Main);
        assert_eq!(instance.stable_branch(), "main");
        assert_eq!(instance.generate_branch_name("MDL-1", None, None), "MDL-1-main");
        assert_eq!(
            instance.generate_branch_name("1", Some("wip"), Some("39")),
            "MDL-1-39-wip"
        );
    }

    #[test]
    fn test_load_rejects_non_instance() {
        let temp = TempDir::new().unwrap();
        let err = Instance::load(
            "x",
            temp.path(),
            temp.path(),
            settings(),
            Box::new(MockGit::default()),
            Box::new(MockRunner::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotAnInstance { .. }));
    }

    #[test]
    fn test_integration_detected_from_upstream_remote() {
        let fixture = Fixture::new("405");
        fixture.git.state().remotes.insert(
            "stable".to_string(),
            "https://git.example/integration.git".to_string(),
        );
        let instance = fixture.instance();
        assert!(instance.is_integration());
        assert!(!instance.is_stable());
    }

    #[test]
    fn test_reload_is_idempotent() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        let mut instance = fixture.instance();
        let before = instance.state().clone();
        instance.reload().unwrap();
        assert_eq!(&before, instance.state());
        instance.reload().unwrap();
        assert_eq!(&before, instance.state());
        assert!(instance.is_installed());
        assert_eq!(
            instance.config_value("dbname"),
            Some(&ConfigValue::Str("stablemain".to_string()))
        );
    }

    #[test]
    fn test_update_without_local_changes_does_not_pop() {
        let fixture = Fixture::new("405");
        fixture.git.state().branches.insert("MDL-1-405".to_string());
        fixture.git.state().current = "MDL-1-405".to_string();
        let mut instance = fixture.instance();

        instance.update(None).unwrap();

        let calls = fixture.git.calls();
        assert!(calls.contains(&"fetch stable ".to_string()));
        assert!(calls.contains(&"checkout MOODLE_405_STABLE".to_string()));
        assert!(calls.contains(&"reset stable/MOODLE_405_STABLE true".to_string()));
        assert!(!fixture.git.called("stash_pop"));
        assert_eq!(fixture.git.state().current, "MDL-1-405");
    }

    #[test]
    fn test_update_restores_stashed_changes() {
        let fixture = Fixture::new("405");
        fixture.git.state().branches.insert("wip".to_string());
        fixture.git.state().current = "wip".to_string();
        fixture.git.state().changes = Some("edits".to_string());
        let mut instance = fixture.instance();

        instance.update(Some("upstream")).unwrap();

        assert!(fixture.git.called("reset upstream/MOODLE_405_STABLE"));
        assert!(fixture.git.called("stash_pop"));
        let state = fixture.git.state();
        assert_eq!(state.changes.as_deref(), Some("edits"));
        assert!(state.stash.is_empty());
        assert_eq!(state.current, "wip");
    }

    #[test]
    fn test_update_fetch_failure_touches_nothing() {
        let fixture = Fixture::new("405");
        fixture.git.state().failing.insert("fetch".to_string());
        let mut instance = fixture.instance();

        assert!(instance.update(None).is_err());
        assert!(!fixture.git.called("stash_save"));
        assert!(!fixture.git.called("reset"));
    }

    #[test]
    fn test_update_reset_failure_restores_branch() {
        let fixture = Fixture::new("405");
        fixture.git.state().branches.insert("wip".to_string());
        fixture.git.state().current = "wip".to_string();
        fixture.git.state().changes = Some("edits".to_string());
        fixture.git.state().failing.insert("reset".to_string());
        let mut instance = fixture.instance();

        assert!(instance.update(None).is_err());
        let state = fixture.git.state();
        assert_eq!(state.current, "wip");
        assert_eq!(state.changes.as_deref(), Some("edits"));
    }

    #[test]
    fn test_upgrade_requires_installation() {
        let fixture = Fixture::new("405");
        let mut instance = fixture.instance();
        assert!(matches!(instance.upgrade(false), Err(Error::NotInstalled { .. })));
    }

    #[test]
    fn test_upgrade_marker_is_not_allowed() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        fs::write(fixture.code().join(NO_UPGRADE_MARKER), "").unwrap();
        let mut instance = fixture.instance();

        let err = instance.upgrade(false).unwrap_err();
        assert!(err.is_skip());
        assert!(fixture.runner.calls().is_empty());
    }

    #[test]
    fn test_upgrade_old_branch_is_unsupported() {
        let fixture = Fixture::new("19");
        fixture.install_config();
        let mut instance = fixture.instance();
        assert!(matches!(instance.upgrade(true), Err(Error::Unsupported { .. })));
    }

    #[test]
    fn test_upgrade_runs_tool_and_restores_branch() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        fs::create_dir_all(fixture.code().join("admin/cli")).unwrap();
        fs::write(fixture.code().join("admin/cli/upgrade.php"), "<?php").unwrap();
        fixture.git.state().branches.insert("wip".to_string());
        fixture.git.state().current = "wip".to_string();
        let mut instance = fixture.instance();

        instance.upgrade(false).unwrap();

        let lines = fixture.runner.command_lines();
        assert_eq!(
            lines,
            vec!["php admin/cli/upgrade.php --non-interactive --allow-unstable"]
        );
        assert!(fixture.git.called("checkout MOODLE_405_STABLE"));
        assert_eq!(fixture.git.state().current, "wip");
    }

    #[test]
    fn test_upgrade_failure_still_restores_branch() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        fs::create_dir_all(fixture.code().join("admin/cli")).unwrap();
        fs::write(fixture.code().join("admin/cli/upgrade.php"), "<?php").unwrap();
        fixture.git.state().branches.insert("wip".to_string());
        fixture.git.state().current = "wip".to_string();
        fixture.runner.clone().failing("upgrade.php");
        let mut instance = fixture.instance();

        let err = instance.upgrade(false).unwrap_err();
        assert!(matches!(err, Error::UpgradeFailed { .. }));
        assert_eq!(fixture.git.state().current, "wip");
    }

    #[test]
    fn test_purge_manual_removes_cache_dirs() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        fs::create_dir_all(fixture.code().join("admin/cli")).unwrap();
        fs::write(fixture.code().join("admin/cli/purge_caches.php"), "<?php").unwrap();
        let cache = fixture.root.join("moodledata/cache");
        fs::create_dir_all(cache.join("x")).unwrap();
        let instance = fixture.instance();

        instance.purge(true).unwrap();

        assert!(!cache.exists());
        assert_eq!(
            fixture.runner.command_lines(),
            vec!["php admin/cli/purge_caches.php"]
        );
    }

    #[test]
    fn test_install_runs_installer_and_writes_settings() {
        let fixture = Fixture::new("405");
        fs::create_dir_all(fixture.code().join("admin/cli")).unwrap();
        fs::write(fixture.code().join("admin/cli/install.php"), "<?php").unwrap();
        let config_file = fixture.code().join("config.php");
        let runner = fixture.runner.clone().writing(
            "install.php",
            &config_file,
            &installed_site_config("stablemain", &fixture.root.join("moodledata")),
        );
        let db = MockDatabase::default();
        let mut instance = fixture.instance();

        instance
            .install(InstallOptions {
                db: &db,
                profile: &profile(),
                db_name: None,
                data_dir: None,
                full_name: None,
                drop_db: false,
                wwwroot: "http://localhost/stable_main".to_string(),
            })
            .unwrap();

        assert!(db.has("stablemain"));
        let line = &runner.command_lines()[0];
        assert!(
            line.starts_with("php admin/cli/install.php --wwwroot=http://localhost/stable_main")
        );
        assert!(line.contains("--dbtype=pgsql"));
        assert!(line.contains("--dbname=stablemain"));
        assert!(line.contains("'--fullname=Stable Main PostgreSQL'"));
        assert!(line.ends_with("--allow-unstable --agree-license --non-interactive"));

        assert!(instance.is_installed());
        assert_eq!(
            instance.config_value("sessioncookiepath"),
            Some(&ConfigValue::Str("/stable_main/".to_string()))
        );
        assert_eq!(instance.config_value("debug"), Some(&ConfigValue::Int(32767)));
    }

    #[test]
    fn test_install_twice_fails_without_touching_database() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        let db = MockDatabase::default();
        let mut instance = fixture.instance();
        let before = fs::read_to_string(fixture.code().join("config.php")).unwrap();

        let err = instance
            .install(InstallOptions {
                db: &db,
                profile: &profile(),
                db_name: None,
                data_dir: None,
                full_name: None,
                drop_db: true,
                wwwroot: "http://localhost/stable_main".to_string(),
            })
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyInstalled { .. }));
        assert!(db.calls.lock().unwrap().is_empty());
        assert!(fixture.runner.calls().is_empty());
        assert_eq!(fs::read_to_string(fixture.code().join("config.php")).unwrap(), before);
    }

    #[test]
    fn test_install_existing_database_requires_drop() {
        let fixture = Fixture::new("405");
        let db = MockDatabase::default().with_database("stablemain");
        let mut instance = fixture.instance();

        let err = instance
            .install(InstallOptions {
                db: &db,
                profile: &profile(),
                db_name: None,
                data_dir: None,
                full_name: None,
                drop_db: false,
                wwwroot: "http://localhost/stable_main".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_install_failure_carries_command() {
        let fixture = Fixture::new("405");
        fixture.runner.clone().failing("install.php");
        let db = MockDatabase::default();
        let mut instance = fixture.instance();

        let err = instance
            .install(InstallOptions {
                db: &db,
                profile: &profile(),
                db_name: Some("custom".to_string()),
                data_dir: None,
                full_name: Some("Site".to_string()),
                drop_db: false,
                wwwroot: "http://localhost/x".to_string(),
            })
            .unwrap_err();
        match err {
            Error::InstallFailed { command: Some(command), .. } => {
                assert!(command.contains("--dbname=custom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!instance.is_installed());
    }

    #[test]
    fn test_uninstall() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        fs::write(fixture.root.join("moodledata/file"), "x").unwrap();
        let db = MockDatabase::default().with_database("stablemain");
        let mut instance = fixture.instance();

        instance.uninstall(&db).unwrap();

        assert!(!db.has("stablemain"));
        assert!(!instance.is_installed());
        assert!(fixture.root.join("moodledata").is_dir());
        assert!(!fixture.root.join("moodledata/file").exists());
    }

    #[test]
    fn test_config_edits_require_installation() {
        let fixture = Fixture::new("405");
        let mut instance = fixture.instance();
        assert!(matches!(
            instance.add_config("debug", &ConfigValue::Int(1)),
            Err(Error::NotInstalled { .. })
        ));

        fixture.install_config();
        instance.reload().unwrap();
        instance.update_config("debug", &ConfigValue::Int(1)).unwrap();
        assert_eq!(instance.config_value("debug"), Some(&ConfigValue::Int(1)));
        assert!(instance.remove_config("debug").unwrap());
        assert_eq!(instance.config_value("debug"), None);
    }

    #[test]
    fn test_run_cli_missing_script() {
        let fixture = Fixture::new("405");
        let instance = fixture.instance();
        assert!(matches!(
            instance.run_cli("admin/cli/nothing.php", &[], false),
            Err(Error::ScriptNotFound { .. })
        ));
    }

    #[test]
    fn test_info_contains_derived_fields() {
        let fixture = Fixture::new("405");
        fixture.install_config();
        let instance = fixture.instance();
        let info = instance.info();
        assert_eq!(info["identifier"], "stable_main");
        assert_eq!(info["stablebranch"], "MOODLE_405_STABLE");
        assert_eq!(info["installed"], "true");
        assert_eq!(info["dbtype"], "pgsql");
        assert_eq!(instance.db_engine().unwrap(), Engine::PgSql);
    }

    #[test]
    fn test_checkout_issue_branch_creates_it_on_stable() {
        let fixture = Fixture::new("405");
        let instance = fixture.instance();

        let branch = instance.checkout_issue_branch("MDL-1234", Some("wip")).unwrap();

        assert_eq!(branch, "MDL-1234-405-wip");
        assert!(fixture
            .git
            .called("create_branch MDL-1234-405-wip stable/MOODLE_405_STABLE"));
        assert_eq!(fixture.git.state().current, "MDL-1234-405-wip");
    }

    #[test]
    fn test_checkout_issue_branch_reuses_existing() {
        let fixture = Fixture::new("405");
        fixture.git.state().branches.insert("MDL-1234-405".to_string());
        let instance = fixture.instance();

        assert_eq!(instance.checkout_issue_branch("1234", None).unwrap(), "MDL-1234-405");
        assert!(!fixture.git.called("create_branch"));
        assert!(fixture.git.called("checkout MDL-1234-405"));
    }

    #[test]
    fn test_default_db_name() {
        assert_eq!(default_db_name("stable_main", ""), "stablemain");
        assert_eq!(default_db_name("Stable-39", "mdk_"), "mdk_stable39");
        assert_eq!(
            default_db_name("integration_main_a_very_long_suffix_indeed", "").len(),
            DB_NAME_MAX_LENGTH
        );
    }

    #[test]
    fn test_default_full_name() {
        assert_eq!(default_full_name("stable_main", Engine::PgSql), "Stable Main PostgreSQL");
        assert_eq!(default_full_name("integration-39", Engine::MariaDb), "Integration 39 MariaDB");
    }
}
