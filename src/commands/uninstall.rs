//! # Uninstall Command Implementation
//!
//! Drops the database of an instance, empties its data directory and removes
//! its `config.php`, leaving the code in place.

use anyhow::Result;
use clap::Args;

use mdk::error::Error;

use super::{confirm, Context};

#[derive(Args, Debug)]
pub struct UninstallArgs {
    /// Instance to uninstall; defaults to the current one
    #[arg(value_name = "NAME")]
    pub name: Option<String>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Execute the `uninstall` command.
pub fn execute(args: UninstallArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let mut instance = ctx.instance(&registry, args.name.as_deref())?;
    if !instance.is_installed() {
        return Err(Error::NotInstalled {
            identifier: instance.identifier().to_string(),
        }
        .into());
    }

    let prompt = format!(
        "Are you sure you want to uninstall {}? The database and the data directory will be deleted",
        instance.identifier()
    );
    if !args.yes && !confirm(&prompt, false)? {
        log::info!("Aborting");
        return Ok(());
    }

    let (_, db) = ctx.database(instance.db_engine()?)?;
    instance.uninstall(&db)?;
    log::info!("{} has been uninstalled", instance.identifier());
    Ok(())
}
