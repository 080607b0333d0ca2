//! # Error Handling
//!
//! This module defines the centralized error type for the `mdk` library. It
//! uses `thiserror` to build one `Error` enum covering every anticipated
//! failure mode, each variant carrying enough context (the command attempted,
//! captured stderr, the instance involved) to diagnose a problem without
//! re-running it.
//!
//! ## Key Components
//!
//! - **`Error`**: The main enum. Variants are grouped by concern:
//!   - instance lookup (`InstanceNotFound`, `NotAnInstance`, `AlreadyExists`)
//!   - installation lifecycle (`AlreadyInstalled`, `NotInstalled`,
//!     `InstallFailed`, `UpgradeNotAllowed`, `UpgradeFailed`, `Unsupported`)
//!   - the fetch workflow (`FetchFailed`, `FetchPlanIncomplete`,
//!     `ConflictPending`)
//!   - external tools (`GitCommand`, `Process`, `Database`)
//!   - the issue tracker (`TrackerUnavailable`, `TrackerIssueNotFound`,
//!     `TrackerRequest`, `Timeout`)
//!   - scripts (`ScriptNotFound`, `AmbiguousScriptName`, `UnsupportedScript`)
//!   - configuration (`Config`, `ConfigKeyMissing`, `ReservedSetting`)
//!   - wrapped library errors (`Io`, `Json`, `Regex`, `Http`, `UrlParse`).
//!
//! - **`Result<T>`**: A type alias for `std::result::Result<T, Error>`.
//!
//! `UpgradeNotAllowed` is deliberately distinct from `UpgradeFailed` so that
//! batch callers can report it as a skip rather than a failure.

use thiserror::Error;

/// Main error type for mdk operations
#[derive(Error, Debug)]
pub enum Error {
    /// No instance could be found under the given name or path.
    #[error("Instance not found: {name}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    InstanceNotFound {
        name: String,
        /// Optional hint for how to locate the instance
        hint: Option<String>,
    },

    /// The directory exists but does not look like a managed instance.
    #[error("Not an instance: {path}: {reason}")]
    NotAnInstance { path: String, reason: String },

    /// Something that must be unique already exists (instance, database, branch).
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    /// The instance is already installed.
    #[error("Instance already installed: {identifier}")]
    AlreadyInstalled { identifier: String },

    /// The operation requires an installed instance.
    #[error("Instance not installed: {identifier}")]
    NotInstalled { identifier: String },

    /// The product installer failed. Carries the attempted command.
    #[error("Install failed: {message}{}", command.as_ref().map(|c| format!("\n  command: {}", c)).unwrap_or_default())]
    InstallFailed {
        message: String,
        command: Option<String>,
    },

    /// An upgrade was refused by a marker file. Not retryable.
    #[error("Upgrade not allowed for {identifier}: {reason}")]
    UpgradeNotAllowed { identifier: String, reason: String },

    /// The upgrade tool ran and failed.
    #[error("Upgrade failed for {identifier}: {message}")]
    UpgradeFailed { identifier: String, message: String },

    /// The product version predates the tool required by an operation.
    #[error("Unsupported operation on {identifier}: {message}")]
    Unsupported { identifier: String, message: String },

    /// A fetch/pull step failed.
    ///
    /// `stash_pending` is set when local changes were stashed before the
    /// failure and are still sitting in the stash.
    #[error("Fetch failed: {message}{}", if *stash_pending { "\n  warning: your local changes may have been left in the stash" } else { "" })]
    FetchFailed { message: String, stash_pending: bool },

    /// Not enough information on the tracker to plan a fetch.
    #[error("Insufficient information to fetch {issue}: {message}")]
    FetchPlanIncomplete { issue: String, message: String },

    /// A merge or patch application stopped on conflicts that need manual resolution.
    #[error("Conflicts while merging {reference}, resolve them and commit{}", if *stash_pending { "\n  warning: your local changes are still in the stash, pop it once resolved" } else { "" })]
    ConflictPending { reference: String, stash_pending: bool },

    /// An error occurred while executing a Git command.
    #[error("Git command failed: {command} - {stderr}")]
    GitCommand { command: String, stderr: String },

    /// An external process could not be run or exited unexpectedly.
    #[error("Process error: {command} - {message}")]
    Process { command: String, message: String },

    /// A database server operation failed.
    #[error("Database error: {message}")]
    Database { message: String },

    /// The issue tracker could not be reached or answered unexpectedly.
    #[error("Tracker unavailable: {message}")]
    TrackerUnavailable { message: String },

    /// The tracker does not know this issue.
    #[error("Tracker issue not found: {key}")]
    TrackerIssueNotFound { key: String },

    /// The tracker refused a request (authorisation, unknown field, failed update).
    #[error("Tracker request failed: {message}")]
    TrackerRequest { message: String },

    /// A bounded wait on an external service elapsed.
    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    /// Filesystem ownership or mode prevents the operation.
    #[error("Permission denied: {path}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    PermissionDenied { path: String, hint: Option<String> },

    /// No script matches the given name.
    #[error("Script not found: {name}")]
    ScriptNotFound { name: String },

    /// More than one script matches the given name.
    #[error("Ambiguous script name {name}, candidates: {}", candidates.join(", "))]
    AmbiguousScriptName {
        name: String,
        candidates: Vec<String>,
    },

    /// The script type cannot be executed.
    #[error("Unsupported script: {name}")]
    UnsupportedScript { name: String },

    /// A branch name could not be parsed back into issue/version/suffix.
    #[error("Could not extract issue number from branch {branch}")]
    BranchNotParsed { branch: String },

    /// A configuration file could not be read, parsed or written.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A required configuration key has no value.
    #[error("Missing configuration value: {key}\n  hint: run 'mdk config set {key} <value>'")]
    ConfigKeyMissing { key: String },

    /// The setting name is reserved by derived instance metadata.
    #[error("Cannot use reserved keyword '{name}' as a setting in config.php")]
    ReservedSetting { name: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON error, wrapped from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A regular expression error, wrapped from `regex::Error`.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// An HTTP client error, wrapped from `reqwest::Error`.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A URL parsing error, wrapped from `url::ParseError`.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether a batch operation should report this as a skip rather than a failure.
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::UpgradeNotAllowed { .. })
    }

    /// Whether this error leaves user changes in the stash.
    pub fn stash_pending(&self) -> bool {
        match self {
            Error::FetchFailed { stash_pending, .. } => *stash_pending,
            Error::ConflictPending { stash_pending, .. } => *stash_pending,
            _ => false,
        }
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
