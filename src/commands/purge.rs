//! # Purge Command Implementation

use anyhow::Result;
use clap::Args;

use mdk::batch::BatchReport;

use super::{finish_batch, Context, InstanceSelection};

/// Purge the caches of instances
#[derive(Args, Debug)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub selection: InstanceSelection,

    /// Delete the cache directories before running the purge script
    #[arg(short, long)]
    pub manual: bool,
}

/// Execute the `purge` command.
pub fn execute(args: PurgeArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let mut report = BatchReport::new();
    for instance in args.selection.resolve(&registry, &mut report)? {
        log::info!("Purging the caches of {}", ctx.output.name(instance.identifier()));
        let result = instance.purge(args.manual);
        report.record(instance.identifier(), result);
    }
    finish_batch(report)
}
