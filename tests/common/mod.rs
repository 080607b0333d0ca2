//! Shared test utilities for integration and E2E tests.
//!
//! This module provides a fixture holding a storage root with fake instances
//! and a user configuration pointing at it.
//!
//! ## Usage
//!
//! Add `mod common;` to your test file, then use the helpers:
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_instance("stable_405", "405");
//!     fixture.command().args(["info", "--list"]).assert().success();
//! }
//! ```

use assert_fs::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Re-export commonly used test dependencies for convenience.
pub mod prelude {
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    #[allow(unused_imports)]
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    #[allow(unused_imports)]
    pub use super::git;
    pub use super::TestFixture;
}

/// A `version.php` declaring `branch`.
pub fn version_file(branch: &str) -> String {
    format!(
        "<?php\n\
         // MOODLE VERSION INFORMATION\n\
         defined('MOODLE_INTERNAL') || die();\n\
         $version  = 2024100700.00;\n\
         $release  = '4.5 (Build: 20241007)';\n\
         $branch   = '{}';\n\
         $maturity = MATURITY_STABLE;\n",
        branch
    )
}

/// A `config.php` as left by the installer.
pub fn site_config(dbname: &str) -> String {
    format!(
        "<?php  // Moodle configuration file\n\
         unset($CFG);\n\
         global $CFG;\n\
         $CFG = new stdClass();\n\
         $CFG->dbtype    = 'pgsql';\n\
         $CFG->dbname    = '{}';\n\
         $CFG->wwwroot   = 'http://localhost/{}';\n\
         require_once(__DIR__ . '/lib/setup.php');\n",
        dbname, dbname
    )
}

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A temporary storage root with a user configuration file pointing at it.
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

impl TestFixture {
    /// Create the storage root and the configuration file.
    pub fn new() -> Self {
        let temp_dir = assert_fs::TempDir::new().expect("Failed to create temp directory");
        temp_dir
            .child("storage")
            .create_dir_all()
            .expect("Failed to create storage");
        let fixture = Self { temp_dir };
        let config = serde_json::json!({
            "dirs": {
                "storage": fixture.storage(),
                "mdk": fixture.path().join("cache"),
                "www": "",
                "moodle": fixture.path().join("home"),
            },
            "tracker": {"url": "http://127.0.0.1:9"}
        });
        fixture
            .temp_dir
            .child("config.json")
            .write_str(&config.to_string())
            .expect("Failed to write config file");
        fixture
    }

    /// Add an instance directory checked out on `branch`.
    pub fn with_instance(self, name: &str, branch: &str) -> Self {
        let root = self.temp_dir.child("storage").child(name);
        root.child("moodle/version.php")
            .write_str(&version_file(branch))
            .expect("Failed to write version.php");
        root.child("moodledata")
            .create_dir_all()
            .expect("Failed to create data dir");
        self
    }

    /// Add an installed instance.
    pub fn with_installed_instance(self, name: &str, branch: &str) -> Self {
        let fixture = self.with_instance(name, branch);
        fixture
            .temp_dir
            .child("storage")
            .child(name)
            .child("moodle/config.php")
            .write_str(&site_config(name))
            .expect("Failed to write config.php");
        fixture
    }

    /// Add a file with the given path and content.
    #[allow(dead_code)]
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.temp_dir
            .child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    /// Get the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn storage(&self) -> PathBuf {
        self.temp_dir.path().join("storage")
    }

    /// The code directory of an instance.
    #[allow(dead_code)]
    pub fn code_dir(&self, name: &str) -> PathBuf {
        self.storage().join(name).join("moodle")
    }

    /// Get the path to the config file.
    pub fn config_path(&self) -> PathBuf {
        self.temp_dir.path().join("config.json")
    }

    /// Create a command using this fixture's configuration, run from its root.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("mdk");
        cmd.current_dir(self.path())
            .env("MDK_CONFIG", self.config_path())
            .env("NO_COLOR", "1")
            .env_remove("MDK_TRACKER_PASSWORD");
        cmd
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_writes_config() {
        let fixture = TestFixture::new();
        assert!(fixture.config_path().exists());
        assert!(fixture.storage().is_dir());
    }

    #[test]
    fn test_fixture_with_instance() {
        let fixture = TestFixture::new().with_installed_instance("stable_405", "405");
        assert!(fixture.code_dir("stable_405").join("version.php").exists());
        assert!(fixture.code_dir("stable_405").join("config.php").exists());
    }
}
