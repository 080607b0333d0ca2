//! Default locations used across commands.

use std::path::{Path, PathBuf};

/// Directory holding the user configuration and mdk's own data.
///
/// `~/.moodle-sdk`, or `.moodle-sdk` in the current directory when the home
/// directory cannot be determined.
pub fn default_mdk_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".moodle-sdk")
}

/// The user configuration file, `~/.moodle-sdk/config.json`.
///
/// Overridden by the `--config` flag or the `MDK_CONFIG` environment variable.
pub fn default_user_config_file() -> PathBuf {
    default_mdk_dir().join("config.json")
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => Path::new(path).to_path_buf(),
    }
}
