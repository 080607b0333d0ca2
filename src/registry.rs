//! # Instance Registry
//!
//! The storage root holds one directory per instance:
//!
//! ```text
//! <dirs.storage>/
//!   stable_main/
//!     moodle/        code directory (a git checkout), `wwwDir`
//!     moodledata/    data directory, `dataDir`
//!     extra/         files produced by tools, `extraDir`
//! ```
//!
//! There is no index: a directory is an instance when it has the code and
//! data directories and the code directory has a readable `version.php`.
//! [`InstanceRegistry`] is the only place that turns names and paths into
//! [`Instance`]s.
//!
//! New instances are cloned from local mirrors kept in `dirs.mdk`
//! (`moodle.git`, `integration.git`), so only the mirrors talk to the network.
//! Cloning and opening repositories goes through [`RepositoryOperations`] so
//! tests can substitute an in-memory double.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::branch::{self, InstanceNamer};
use crate::config::Config;
use crate::database::DatabaseServer;
use crate::error::{Error, Result};
use crate::git::{self, Git, GitOperations};
use crate::instance::{is_instance_dir, ConfigValue, Instance, InstanceSettings};
use crate::process::{DockerRunner, HostRunner, Runner};

pub const STABLE_CACHE: &str = "moodle.git";
pub const INTEGRATION_CACHE: &str = "integration.git";

/// Which instances [`InstanceRegistry::list`] returns. Both flags unset means all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub integration: bool,
    pub stable: bool,
}

impl InstanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn integration() -> Self {
        Self {
            integration: true,
            stable: false,
        }
    }

    pub fn stable() -> Self {
        Self {
            integration: false,
            stable: true,
        }
    }

    fn is_active(&self) -> bool {
        self.integration || self.stable
    }
}

/// A directory of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Base,
    Code,
    Data,
    Extra,
}

/// Creating, opening and refreshing repositories.
pub trait RepositoryOperations {
    fn open(&self, path: &Path) -> Box<dyn GitOperations>;
    fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()>;
    fn clone_repository(&self, source: &str, dest: &Path) -> Result<()>;
    fn fetch_mirror(&self, path: &Path) -> Result<()>;
}

/// Uses the configured `git` binary.
#[derive(Debug, Clone)]
pub struct DefaultRepositoryOperations {
    bin: String,
}

impl DefaultRepositoryOperations {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl RepositoryOperations for DefaultRepositoryOperations {
    fn open(&self, path: &Path) -> Box<dyn GitOperations> {
        Box::new(Git::new(path, self.bin.clone()))
    }

    fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()> {
        git::clone_mirror(&self.bin, url, dest)
    }

    fn clone_repository(&self, source: &str, dest: &Path) -> Result<()> {
        git::clone(&self.bin, source, dest)
    }

    fn fetch_mirror(&self, path: &Path) -> Result<()> {
        git::fetch_mirror(&self.bin, path)
    }
}

/// Parameters of [`InstanceRegistry::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// `main` or a numbered branch such as `405`.
    pub version: String,
    pub integration: bool,
    pub suffix: Option<String>,
    pub identifier: Option<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            version: branch::MAIN_BRANCH.to_string(),
            integration: false,
            suffix: None,
            identifier: None,
        }
    }
}

pub struct InstanceRegistry {
    base: PathBuf,
    www_dir: String,
    data_dir: String,
    extra_dir: String,
    mdk_dir: String,
    cache_dir: PathBuf,
    web_root: Option<PathBuf>,
    config: Config,
    settings: InstanceSettings,
    namer: InstanceNamer,
    repositories: Box<dyn RepositoryOperations>,
}

impl InstanceRegistry {
    /// Open the storage root named by `dirs.storage`, which must exist.
    pub fn new(config: &Config) -> Result<Self> {
        let base = config
            .get_path("dirs.storage")
            .ok_or_else(|| Error::ConfigKeyMissing {
                key: "dirs.storage".to_string(),
            })?;
        if !base.is_dir() {
            return Err(Error::Config {
                message: format!(
                    "storage directory {} not found\n  hint: create it or run 'mdk config set dirs.storage <path>'",
                    base.display()
                ),
            });
        }
        let base = fs::canonicalize(&base)?;
        let setting = |key: &str, default: &str| config.get_str(key).unwrap_or(default).to_string();
        Ok(Self {
            base,
            www_dir: setting("wwwDir", "moodle"),
            data_dir: setting("dataDir", "moodledata"),
            extra_dir: setting("extraDir", "extra"),
            mdk_dir: setting("mdkDir", "mdk"),
            cache_dir: config
                .get_path("dirs.mdk")
                .unwrap_or_else(crate::defaults::default_mdk_dir),
            web_root: config.get_path("dirs.www"),
            config: config.clone(),
            settings: InstanceSettings::from_config(config)?,
            namer: InstanceNamer::from_config(config),
            repositories: Box::new(DefaultRepositoryOperations::new(setting("git", "git"))),
        })
    }

    pub fn with_repositories(mut self, repositories: Box<dyn RepositoryOperations>) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    pub fn path_of(&self, name: &str, dir: Dir) -> PathBuf {
        let base = self.base.join(name);
        match dir {
            Dir::Base => base,
            Dir::Code => base.join(&self.www_dir),
            Dir::Data => base.join(&self.data_dir),
            Dir::Extra => base.join(&self.extra_dir),
        }
    }

    /// Whether `name` has the instance layout and a product checkout.
    pub fn is_instance(&self, name: &str) -> bool {
        if name.is_empty() || name.contains(std::path::is_separator) {
            return false;
        }
        let code = self.path_of(name, Dir::Code);
        self.path_of(name, Dir::Data).is_dir() && code.is_dir() && is_instance_dir(&code)
    }

    /// Sorted identifiers of the instances in the storage root.
    pub fn list(&self, filter: InstanceFilter) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.is_instance(&name) {
                continue;
            }
            if filter.is_active() {
                let instance = match self.load(&name) {
                    Ok(instance) => instance,
                    Err(e) => {
                        log::debug!("Skipping {}: {}", name, e);
                        continue;
                    }
                };
                let integration = instance.is_integration();
                if !(filter.integration && integration || filter.stable && !integration) {
                    continue;
                }
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Load an instance by identifier, or by a path inside the storage root.
    pub fn get(&self, name_or_path: &str) -> Result<Instance> {
        let name = if name_or_path.contains(std::path::is_separator) {
            self.identifier_from_path(Path::new(name_or_path))
                .ok_or_else(|| Error::InstanceNotFound {
                    name: name_or_path.to_string(),
                    hint: Some(format!("instances live in {}", self.base.display())),
                })?
        } else {
            name_or_path.to_string()
        };

        if !self.is_instance(&name) {
            let root = self.path_of(&name, Dir::Base);
            if root.is_dir() {
                return Err(Error::NotAnInstance {
                    path: root.display().to_string(),
                    reason: format!(
                        "expected {}/ and {}/ with a product checkout",
                        self.www_dir, self.data_dir
                    ),
                });
            }
            return Err(Error::InstanceNotFound {
                name,
                hint: Some("Run 'mdk info --list' to see the available instances".to_string()),
            });
        }
        self.load(&name)
    }

    fn load(&self, name: &str) -> Result<Instance> {
        let code = self.path_of(name, Dir::Code);
        let git = self.repositories.open(&code);
        Instance::load(
            name,
            code,
            self.path_of(name, Dir::Data),
            self.settings.clone(),
            git,
            self.runner_for(name),
        )
    }

    /// A Docker runner when `docker.containers.<name>` is set, the host otherwise.
    fn runner_for(&self, name: &str) -> Box<dyn Runner> {
        let container = self
            .config
            .get("docker.containers")
            .and_then(|containers| containers.get(name))
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty());
        match container {
            Some(container) => Box::new(DockerRunner::new(container)),
            None => Box::new(HostRunner::new()),
        }
    }

    /// The first path component below the storage root.
    fn identifier_from_path(&self, path: &Path) -> Option<String> {
        let path = fs::canonicalize(path).ok()?;
        let relative = path.strip_prefix(&self.base).ok()?;
        relative
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .map(str::to_string)
    }

    /// Find an instance by name or path like [`get`](Self::get), or from
    /// `path` (the working directory by default) by walking up to the
    /// instance containing it.
    pub fn resolve(&self, name: Option<&str>, path: Option<&Path>) -> Result<Option<Instance>> {
        if let Some(name) = name {
            return match self.get(name) {
                Ok(instance) => Ok(Some(instance)),
                Err(Error::InstanceNotFound { .. } | Error::NotAnInstance { .. }) => Ok(None),
                Err(e) => Err(e),
            };
        }

        let start = match path {
            Some(path) => path.to_path_buf(),
            None => std::env::current_dir()?,
        };
        let Ok(start) = fs::canonicalize(&start) else {
            return Ok(None);
        };
        for ancestor in start.ancestors() {
            if ancestor.parent() != Some(self.base.as_path()) {
                continue;
            }
            let Some(name) = ancestor.file_name().and_then(|n| n.to_str()) else {
                break;
            };
            if self.is_instance(name) {
                return self.get(name).map(Some);
            }
            break;
        }
        Ok(None)
    }

    /// Resolve each name, dropping those that cannot be resolved. No names
    /// means the instance containing the working directory.
    pub fn resolve_multiple(&self, names: &[String]) -> Result<Vec<Instance>> {
        if names.is_empty() {
            return Ok(self.resolve(None, None)?.into_iter().collect());
        }
        let mut instances = Vec::with_capacity(names.len());
        for name in names {
            match self.resolve(Some(name), None) {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => log::info!("Could not find instance called {}", name),
                Err(e) => log::info!("Could not load instance {}: {}", name, e),
            }
        }
        Ok(instances)
    }

    pub fn generate_instance_name(
        &self,
        version: &str,
        integration: bool,
        suffix: Option<&str>,
        identifier: Option<&str>,
    ) -> String {
        self.namer.generate(version, integration, suffix, identifier)
    }

    /// `scheme://host[/path]/name`
    pub fn url_of(&self, name: &str) -> String {
        let scheme = self.config.get_str("scheme").unwrap_or("http");
        let host = self.config.get_str("host").unwrap_or("localhost");
        let mut url = format!("{}://{}", scheme, host);
        if !self.settings.url_path.is_empty() {
            url.push('/');
            url.push_str(&self.settings.url_path);
        }
        url.push('/');
        url.push_str(name);
        url
    }

    pub fn cache_path(&self, integration: bool) -> PathBuf {
        self.cache_dir.join(if integration {
            INTEGRATION_CACHE
        } else {
            STABLE_CACHE
        })
    }

    fn remote_url(&self, integration: bool) -> Result<String> {
        self.config.get_string(if integration {
            "remotes.integration"
        } else {
            "remotes.stable"
        })
    }

    /// Create the missing mirrors. A mirror is seeded from the other one when
    /// it exists, and left to be fetched later.
    pub fn check_cached_clones(&self, stable: bool, integration: bool) -> Result<()> {
        for (wanted, is_integration) in [(stable, false), (integration, true)] {
            let cache = self.cache_path(is_integration);
            if !wanted || cache.is_dir() {
                continue;
            }
            let url = self.remote_url(is_integration)?;
            let other = self.cache_path(!is_integration);
            if other.is_dir() {
                log::info!("Seeding {} from {}", cache.display(), other.display());
                copy_dir(&other, &cache)?;
                self.repositories.open(&cache).set_remote("origin", &url)?;
            } else {
                log::info!(
                    "Cloning {} into {}, this is going to take a while",
                    url,
                    cache.display()
                );
                self.repositories.clone_mirror(&url, &cache)?;
            }
        }
        Ok(())
    }

    /// Fetch the existing mirrors.
    pub fn update_cached_clones(&self, stable: bool, integration: bool) -> Result<()> {
        for (wanted, is_integration) in [(integration, true), (stable, false)] {
            let cache = self.cache_path(is_integration);
            if !wanted || !cache.is_dir() {
                continue;
            }
            log::info!("Fetching cached repository {}", cache.display());
            self.repositories.fetch_mirror(&cache)?;
        }
        Ok(())
    }

    /// Remotes of an instance that are missing or point somewhere unexpected.
    ///
    /// The upstream remote should point at the mirror when
    /// `useCacheAsUpstreamRemote` is on, at the real repository otherwise.
    /// The personal remote is only checked when `remotes.mine` is set.
    pub fn remote_problems(&self, instance: &Instance) -> Result<Vec<String>> {
        let git = instance.git();
        let mut problems = Vec::new();

        let upstream = &self.settings.upstream_remote;
        let expected = if self.config.get_bool("useCacheAsUpstreamRemote").unwrap_or(false) {
            self.cache_path(instance.is_integration())
                .to_string_lossy()
                .into_owned()
        } else {
            self.remote_url(instance.is_integration())?
        };
        match git.get_remote(upstream)? {
            None => problems.push(format!("Missing remote {}", upstream)),
            Some(url) if url != expected => problems.push(format!(
                "Remote {} is not {}, it points to {}",
                upstream, expected, url
            )),
            Some(_) => {}
        }

        if let Some(mine) = self.config.get_str("remotes.mine").filter(|u| !u.is_empty()) {
            let remote = &self.settings.my_remote;
            match git.get_remote(remote)? {
                None => problems.push(format!("Missing remote {}", remote)),
                Some(url) if url != mine => problems.push(format!(
                    "Remote {} is not {}, it points to {}",
                    remote, mine, url
                )),
                Some(_) => {}
            }
        }
        Ok(problems)
    }

    /// Clone a new instance from the mirrors and check out its stable branch.
    pub fn create(&self, options: &CreateOptions) -> Result<Instance> {
        let name = self.generate_instance_name(
            &options.version,
            options.integration,
            options.suffix.as_deref(),
            options.identifier.as_deref(),
        );
        if name == self.mdk_dir {
            return Err(Error::Config {
                message: format!(
                    "an instance cannot be called '{}', this is a reserved word",
                    name
                ),
            });
        }
        if self.is_instance(&name) {
            return Err(Error::AlreadyExists {
                kind: "Instance".to_string(),
                name,
            });
        }
        let root = self.path_of(&name, Dir::Base);
        if root.exists() {
            return Err(Error::AlreadyExists {
                kind: "Installation path".to_string(),
                name: root.display().to_string(),
            });
        }

        self.check_cached_clones(!options.integration, options.integration)?;
        self.update_cached_clones(!options.integration, options.integration)?;

        let code = self.path_of(&name, Dir::Code);
        let data = self.path_of(&name, Dir::Data);
        let extra = self.path_of(&name, Dir::Extra);
        fs::create_dir_all(&root)?;
        create_shared_dir(&data)?;
        create_shared_dir(&extra)?;

        let cache = self.cache_path(options.integration);
        log::info!("Cloning repository into {}", code.display());
        self.repositories.clone_repository(&cache.to_string_lossy(), &code)?;
        self.link_into_web_root(&name, &code, &extra);

        log::info!("Checking out branch");
        let repo = self.repositories.open(&code);
        let upstream = &self.settings.upstream_remote;
        repo.remove_remote("origin")?;
        if let Some(mine) = self.config.get_str("remotes.mine").filter(|u| !u.is_empty()) {
            repo.set_remote(&self.settings.my_remote, mine)?;
        }
        repo.set_remote(upstream, &cache.to_string_lossy())?;
        repo.fetch(upstream, None)?;

        let stable = branch::stable_branch(&options.version);
        let track = format!("{}/{}", upstream, stable);
        if !repo.has_branch(&stable, None)? {
            if let Err(e) = repo.create_branch(&stable, Some(&track)) {
                log::error!("Could not create branch {} tracking {}: {}", stable, track, e);
            }
        }
        repo.checkout(&stable)?;
        let pulled = repo.pull(upstream, None)?;
        if !pulled.success() {
            log::warn!("Could not pull from {}: {}", upstream, pulled.stderr.trim());
        }

        if !self.config.get_bool("useCacheAsUpstreamRemote").unwrap_or(false) {
            if let Ok(real) = self.remote_url(options.integration) {
                repo.set_remote(upstream, &real)?;
            }
        }

        self.get(&name)
    }

    fn link_into_web_root(&self, name: &str, code: &Path, extra: &Path) {
        let Some(web_root) = self.web_root.as_ref().filter(|w| w.is_dir()) else {
            return;
        };
        let links = [
            (code, web_root.join(name)),
            (extra, web_root.join(&self.mdk_dir).join(name)),
        ];
        for (target, link) in links {
            if link.exists() {
                log::warn!(
                    "Could not create symbolic link, please create it manually: ln -s {} {}",
                    target.display(),
                    link.display()
                );
                continue;
            }
            if let Some(parent) = link.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    log::warn!("Could not create {}: {}", parent.display(), e);
                    continue;
                }
            }
            if let Err(e) = symlink(target, &link) {
                log::warn!("Could not link {} to {}: {}", link.display(), target.display(), e);
            }
        }
    }

    /// Remove an instance's directory, its web links and, when `db` is given,
    /// its database.
    pub fn delete(&self, name: &str, db: Option<&dyn DatabaseServer>) -> Result<()> {
        let instance = self.get(name)?;
        let root = self.path_of(instance.identifier(), Dir::Base);

        log::info!("Removing {}", root.display());
        fs::remove_dir_all(&root).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied {
                path: root.display().to_string(),
                hint: Some(format!("try 'sudo chmod -R u+w {}'", root.display())),
            },
            _ => Error::Io(e),
        })?;

        if let Some(web_root) = &self.web_root {
            for link in [web_root.join(name), web_root.join(&self.mdk_dir).join(name)] {
                if link.is_symlink() {
                    if let Err(e) = fs::remove_file(&link) {
                        log::debug!("Could not remove {}: {}", link.display(), e);
                    }
                }
            }
        }

        if let (Some(db), Some(ConfigValue::Str(db_name))) = (db, instance.config_value("dbname")) {
            if db.exists(db_name)? {
                log::info!("Dropping database {}", db_name);
                db.drop_database(db_name)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_shared_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    Ok(())
}

#[cfg(not(unix))]
fn create_shared_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("symbolic links are not supported for {}", link.display()),
    ))
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
