//! # Update Command Implementation
//!
//! Fetches the upstream remote of each selected instance and hard resets its
//! stable branch, optionally running the upgrade script afterwards. With
//! `--cached`, only the mirrors instances are cloned from are fetched.

use anyhow::Result;
use clap::Args;

use mdk::batch::BatchReport;
use mdk::instance::Instance;

use super::{finish_batch, Context, InstanceSelection};

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub selection: InstanceSelection,

    /// Only update the cached mirrors
    #[arg(short, long, conflicts_with_all = ["names", "all", "integration", "stable", "upgrade"])]
    pub cached: bool,

    /// Upgrade the installed instances once updated
    #[arg(short, long)]
    pub upgrade: bool,
}

/// Execute the `update` command.
pub fn execute(args: UpdateArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;

    if args.cached || ctx.config.get_bool("useCacheAsUpstreamRemote").unwrap_or(false) {
        let spinner = ctx.output.spinner("Updating cached repositories");
        let result = registry.update_cached_clones(true, true);
        spinner.finish_and_clear();
        result?;
        if args.cached {
            return Ok(());
        }
    }

    let mut report = BatchReport::new();
    for mut instance in args.selection.resolve(&registry, &mut report)? {
        let result = update_one(&mut instance, args.upgrade);
        report.record(instance.identifier(), result);
    }
    finish_batch(report)
}

fn update_one(instance: &mut Instance, upgrade: bool) -> mdk::error::Result<()> {
    instance.update(None)?;
    if upgrade && instance.is_installed() {
        instance.upgrade(false)?;
    }
    Ok(())
}
