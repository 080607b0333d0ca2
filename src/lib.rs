//! # Moodle Development Kit
//!
//! This library provides the core functionality behind the `mdk` command-line
//! tool: managing local development instances of Moodle and moving work
//! between them, the issue tracker and git remotes.
//!
//! ## Quick Example
//!
//! ```
//! use mdk::branch::BranchNamer;
//!
//! let namer = BranchNamer::with_defaults().unwrap();
//! let branch = namer.generate("MDL-1234", "405", Some("fix"));
//! assert_eq!(branch, "MDL-1234-405-fix");
//!
//! let parsed = namer.parse(&branch).unwrap();
//! assert_eq!(parsed.issue, "1234");
//! assert_eq!(parsed.suffix.as_deref(), Some("fix"));
//! ```
//!
//! ## Core Concepts
//!
//! - **Configuration (`config`)**: Layered JSON settings (distribution
//!   defaults, system file, user file) with diff-based persistence.
//! - **Instances (`instance`, `registry`)**: A storage root holds one directory
//!   per instance. The [`registry::InstanceRegistry`] enumerates and resolves
//!   them; an [`instance::Instance`] derives its branch, version and settings
//!   from the files on disk and runs install, update and upgrade operations.
//! - **Naming (`branch`)**: Canonical branch and instance names built from an
//!   issue number, a version and a suffix, and parsed back.
//! - **Fetching (`fetch`, `backport`)**: Turning a tracker issue into a remote
//!   branch or a set of patches, and bringing it into an instance inside a
//!   stash cycle; cherry-picking a branch across stable versions.
//! - **Collaborators (`git`, `process`, `database`, `tracker`)**: Traits in
//!   front of every external tool so they can be substituted in tests.
//!
//! Everything runs sequentially. Batch commands process one instance to
//! completion before the next and aggregate failures with [`batch::BatchReport`].

pub mod backport;
pub mod batch;
pub mod branch;
pub mod config;
pub mod database;
pub mod defaults;
pub mod error;
pub mod fetch;
pub mod git;
pub mod instance;
pub mod output;
pub mod process;
pub mod registry;
pub mod scripts;
pub mod suggestions;
pub mod tracker;

#[cfg(test)]
mod naming_proptest;
#[cfg(test)]
mod test_support;
