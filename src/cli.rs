//! CLI argument parsing and command dispatch

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use log::Level;
use std::io::Write;
use std::path::PathBuf;

use mdk::config::Config;
use mdk::output::OutputConfig;

use crate::commands::{self, Context};

/// Moodle Development Kit - Manage local Moodle development instances
#[derive(Parser, Debug)]
#[command(name = "mdk")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// User configuration file (defaults to ~/.moodle-sdk/config.json)
    #[arg(long, global = true, value_name = "FILE", env = "MDK_CONFIG")]
    config: Option<PathBuf>,

    /// Colorize output (always, never, auto)
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    color: String,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cherry-pick a branch onto other stable versions
    Backport(commands::backport::BackportArgs),

    /// Check the configuration and the remotes of instances
    Check(commands::check::CheckArgs),

    /// Generate shell completion scripts
    Completions(commands::completions::CompletionsArgs),

    /// Read and write the mdk settings
    Config(commands::config::ConfigArgs),

    /// Create new instances
    Create(commands::create::CreateArgs),

    /// Check out the branch of an issue, creating it when needed
    Fix(commands::fix::FixArgs),

    /// Show information about an instance, or list them
    Info(commands::info::InfoArgs),

    /// Install an instance
    Install(commands::install::InstallArgs),

    /// Purge the caches of instances
    Purge(commands::purge::PurgeArgs),

    /// Pull the work of an issue into an instance
    Pull(commands::pull::PullArgs),

    /// Push a branch to a remote
    Push(commands::push::PushArgs),

    /// Rebase issue branches on the latest stable branch
    Rebase(commands::rebase::RebaseArgs),

    /// Completely remove an instance
    Remove(commands::remove::RemoveArgs),

    /// Run a script on instances
    Run(commands::run::RunArgs),

    /// Show an issue of the tracker
    Tracker(commands::tracker::TrackerArgs),

    /// Drop the database of an instance and its data
    Uninstall(commands::uninstall::UninstallArgs),

    /// Update instances from their upstream remote
    Update(commands::update::UpdateArgs),

    /// Run the upgrade script of instances
    Upgrade(commands::upgrade::UpgradeArgs),
}

impl Cli {
    /// Whether errors should be printed with their full chain.
    pub fn is_verbose(&self) -> bool {
        matches!(self.log_level.to_lowercase().as_str(), "debug" | "trace")
    }

    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        init_logging(&self.log_level);
        let output = OutputConfig::from_env_and_flag(&self.color);
        let config_file = self.config;
        let load = move || -> Result<Context> {
            let config =
                Config::load(config_file.as_deref()).context("Failed to load the configuration")?;
            Ok(Context { config, output })
        };

        match self.command {
            Commands::Backport(args) => commands::backport::execute(args, &load()?),
            Commands::Check(args) => commands::check::execute(args, &load()?),
            Commands::Completions(args) => commands::completions::execute(args),
            Commands::Config(args) => commands::config::execute(args, &load()?),
            Commands::Create(args) => commands::create::execute(args, &load()?),
            Commands::Fix(args) => commands::fix::execute(args, &load()?),
            Commands::Info(args) => commands::info::execute(args, &load()?),
            Commands::Install(args) => commands::install::execute(args, &load()?),
            Commands::Purge(args) => commands::purge::execute(args, &load()?),
            Commands::Pull(args) => commands::pull::execute(args, &load()?),
            Commands::Push(args) => commands::push::execute(args, &load()?),
            Commands::Rebase(args) => commands::rebase::execute(args, &load()?),
            Commands::Remove(args) => commands::remove::execute(args, &load()?),
            Commands::Run(args) => commands::run::execute(args, &load()?),
            Commands::Tracker(args) => commands::tracker::execute(args, &load()?),
            Commands::Uninstall(args) => commands::uninstall::execute(args, &load()?),
            Commands::Update(args) => commands::update::execute(args, &load()?),
            Commands::Upgrade(args) => commands::upgrade::execute(args, &load()?),
        }
    }
}

/// Log to stderr without timestamps; warnings and errors carry their level.
fn init_logging(level: &str) {
    let _ = env_logger::Builder::new()
        .parse_filters(level)
        .format(|buf, record| match record.level() {
            Level::Error | Level::Warn => writeln!(
                buf,
                "{}: {}",
                record.level().as_str().to_lowercase(),
                record.args()
            ),
            _ => writeln!(buf, "{}", record.args()),
        })
        .try_init();
}
