//! Named helper scripts run inside an instance.
//!
//! Scripts are looked up by name in a list of directories, first match wins.
//! A script is copied into the instance's code directory as
//! `mdkscriptrun.<ext>`, executed from there, and removed afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::process::{CommandOutput, CommandSpec, Runner};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["php", "sh"];
pub const SYSTEM_SCRIPTS_DIR: &str = "/etc/moodle-sdk/scripts";
const RUN_FILE_STEM: &str = "mdkscriptrun";

#[derive(Debug, Clone)]
pub struct ScriptLibrary {
    dirs: Vec<PathBuf>,
}

impl ScriptLibrary {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// `dirs.moodle/scripts`, `dirs.mdk/scripts`, then the system directory.
    pub fn from_config(config: &Config) -> Self {
        let mut dirs: Vec<PathBuf> = ["dirs.moodle", "dirs.mdk"]
            .iter()
            .filter_map(|key| config.get_path(key))
            .map(|dir| dir.join("scripts"))
            .collect();
        dirs.push(PathBuf::from(SYSTEM_SCRIPTS_DIR));
        dirs.dedup();
        Self::new(dirs)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Every available script by file name; earlier directories shadow later ones.
    pub fn list(&self) -> BTreeMap<String, PathBuf> {
        let mut scripts = BTreeMap::new();
        for dir in &self.dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() || !is_supported(&path) {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    scripts.entry(name.to_string()).or_insert(path);
                }
            }
        }
        scripts
    }

    /// Find `name` exactly, or as `name.<ext>` when the extension is omitted.
    pub fn find(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.dirs {
            let exact = dir.join(name);
            if exact.is_file() && is_supported(&exact) {
                return Ok(exact);
            }
            let mut candidates: Vec<PathBuf> = SUPPORTED_EXTENSIONS
                .iter()
                .map(|ext| dir.join(format!("{}.{}", name, ext)))
                .filter(|p| p.is_file())
                .collect();
            if candidates.len() > 1 {
                return Err(Error::AmbiguousScriptName {
                    name: name.to_string(),
                    candidates: candidates
                        .iter()
                        .filter_map(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned())
                        .collect(),
                });
            }
            if let Some(found) = candidates.pop() {
                return Ok(found);
            }
        }
        Err(Error::ScriptNotFound {
            name: name.to_string(),
        })
    }

    /// Copy the script into `code_dir`, run it there, and remove the copy.
    pub fn run(
        &self,
        name: &str,
        code_dir: &Path,
        args: &[String],
        runner: &dyn Runner,
        php: &str,
    ) -> Result<CommandOutput> {
        let script = self.find(name)?;
        let ext = extension(&script).ok_or_else(|| Error::UnsupportedScript {
            name: name.to_string(),
        })?;
        let file_name = format!("{}.{}", RUN_FILE_STEM, ext);
        let dest = code_dir.join(&file_name);
        fs::copy(&script, &dest)?;

        let spec = match ext {
            "php" => CommandSpec::new(php).arg(&file_name),
            "sh" => {
                make_executable(&dest)?;
                CommandSpec::new(format!("./{}", file_name))
            }
            _ => {
                fs::remove_file(&dest)?;
                return Err(Error::UnsupportedScript {
                    name: name.to_string(),
                });
            }
        };
        let spec = spec.args(args.iter().cloned()).cwd(code_dir).inherit_output();

        log::info!("Running script {}", script.display());
        let result = runner.exec(&spec);
        if let Err(e) = fs::remove_file(&dest) {
            log::warn!("Could not remove {}: {}", dest.display(), e);
        }
        result
    }
}

fn extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    SUPPORTED_EXTENSIONS.iter().copied().find(|s| *s == ext)
}

fn is_supported(path: &Path) -> bool {
    extension(path).is_some()
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
