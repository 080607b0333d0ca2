//! # Upgrade Command Implementation
//!
//! Runs the upgrade script of each selected instance on its stable branch.
//! Instances carrying a `.noupgrade` marker are skipped, not failed.

use anyhow::Result;
use clap::Args;

use mdk::batch::BatchReport;
use mdk::instance::Instance;

use super::{finish_batch, Context, InstanceSelection};

#[derive(Args, Debug)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub selection: InstanceSelection,

    /// Upgrade on the current branch instead of the stable branch
    #[arg(short = 'n', long)]
    pub no_checkout: bool,

    /// Update the instances before upgrading
    #[arg(short, long)]
    pub update: bool,
}

/// Execute the `upgrade` command.
pub fn execute(args: UpgradeArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let mut report = BatchReport::new();
    for mut instance in args.selection.resolve(&registry, &mut report)? {
        let result = upgrade_one(&mut instance, args.update, args.no_checkout);
        report.record(instance.identifier(), result);
    }
    finish_batch(report)
}

fn upgrade_one(instance: &mut Instance, update: bool, no_checkout: bool) -> mdk::error::Result<()> {
    if update {
        instance.update(None)?;
    }
    instance.upgrade(no_checkout)
}
