//! # CLI Command Implementations
//!
//! This module contains the implementation for each subcommand of the `mdk`
//! command-line tool. Each subcommand is defined in its own file to keep the
//! logic separated and maintainable.
//!
//! ## Structure
//!
//! Each command module typically contains:
//! - An `Args` struct that defines the command-specific arguments and options,
//!   derived using `clap`.
//! - An `execute` function that takes the parsed `Args` and the shared
//!   [`Context`] and performs the command's logic.
//!
//! The `execute` function is the main entry point for the command and is
//! responsible for orchestrating the necessary operations, calling into the
//! `mdk` library to perform the core logic.

pub mod backport;
pub mod check;
pub mod completions;
pub mod config;
pub mod create;
pub mod fix;
pub mod info;
pub mod install;
pub mod pull;
pub mod purge;
pub mod push;
pub mod rebase;
pub mod remove;
pub mod run;
pub mod tracker;
pub mod uninstall;
pub mod update;
pub mod upgrade;

use anyhow::Result;
use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};

use mdk::batch::BatchReport;
use mdk::config::Config;
use mdk::database::{CliDatabase, DatabaseProfile, Engine};
use mdk::instance::Instance;
use mdk::output::OutputConfig;
use mdk::registry::{InstanceFilter, InstanceRegistry};
use mdk::suggestions;
use mdk::tracker::JiraClient;

/// State shared by every command once the configuration is loaded.
pub struct Context {
    pub config: Config,
    pub output: OutputConfig,
}

impl Context {
    pub fn registry(&self) -> Result<InstanceRegistry> {
        Ok(InstanceRegistry::new(&self.config)?)
    }

    /// The named instance, or the one containing the working directory.
    pub fn instance(&self, registry: &InstanceRegistry, name: Option<&str>) -> Result<Instance> {
        registry
            .resolve(name, None)?
            .ok_or_else(|| suggestions::instance_not_resolved(name))
    }

    /// `flag`, else the `defaultEngine` setting.
    pub fn engine(&self, flag: Option<&str>) -> Result<Engine> {
        let name = flag
            .or_else(|| self.config.get_str("defaultEngine"))
            .unwrap_or("mysqli");
        Ok(name.parse()?)
    }

    pub fn database(&self, engine: Engine) -> Result<(DatabaseProfile, CliDatabase)> {
        let profile = DatabaseProfile::from_config(&self.config, engine)?;
        let db = CliDatabase::new(profile.clone());
        Ok((profile, db))
    }

    pub fn tracker(&self) -> Result<JiraClient> {
        Ok(JiraClient::from_config(&self.config)?)
    }

    /// A tracker client able to modify issues.
    pub fn authenticated_tracker(&self) -> Result<JiraClient> {
        let tracker = self.tracker()?;
        if !tracker.has_credentials() {
            return Err(suggestions::tracker_credentials_missing());
        }
        Ok(tracker)
    }
}

/// Instance selection shared by the batch commands.
#[derive(Args, Debug, Default)]
pub struct InstanceSelection {
    /// Instances to work on; defaults to the current one
    #[arg(value_name = "NAME")]
    pub names: Vec<String>,

    /// Work on every instance
    #[arg(short, long)]
    pub all: bool,

    /// Work on the integration instances
    #[arg(short, long, conflicts_with = "all")]
    pub integration: bool,

    /// Work on the stable instances
    #[arg(short, long, conflicts_with = "all")]
    pub stable: bool,
}

impl InstanceSelection {
    fn filter(&self) -> Option<InstanceFilter> {
        if self.all || (self.integration && self.stable) {
            Some(InstanceFilter::all())
        } else if self.integration {
            Some(InstanceFilter::integration())
        } else if self.stable {
            Some(InstanceFilter::stable())
        } else {
            None
        }
    }

    /// Resolve the selected instances. Names or paths that cannot be
    /// resolved are logged and recorded as failures in `report`.
    pub fn resolve(
        &self,
        registry: &InstanceRegistry,
        report: &mut BatchReport,
    ) -> Result<Vec<Instance>> {
        if let Some(filter) = self.filter() {
            let mut instances = Vec::new();
            for name in registry.list(filter)? {
                match registry.get(&name) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => report.fail(&name, e.to_string()),
                }
            }
            return Ok(instances);
        }

        if self.names.is_empty() {
            let instances = registry.resolve_multiple(&self.names)?;
            if instances.is_empty() {
                return Err(suggestions::instance_not_resolved(None));
            }
            return Ok(instances);
        }

        let mut instances = Vec::with_capacity(self.names.len());
        for name in &self.names {
            match registry.resolve(Some(name), None) {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => {
                    log::info!("Could not find instance called {}", name);
                    report.fail(name, "no such instance");
                }
                Err(e) => report.fail(name, e.to_string()),
            }
        }
        if instances.is_empty() {
            return Err(suggestions::instance_not_resolved(
                self.names.first().map(String::as_str),
            ));
        }
        Ok(instances)
    }
}

/// Ask a yes/no question on the terminal.
pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

/// Log the batch summary and turn a failed batch into an error.
pub fn finish_batch(report: BatchReport) -> Result<()> {
    report.log_summary();
    match report.error() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
