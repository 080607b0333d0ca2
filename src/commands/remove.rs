//! # Remove Command Implementation
//!
//! Deletes an instance completely: its directories, its web links and, when
//! it is installed, its database.

use anyhow::Result;
use clap::Args;

use mdk::database::DatabaseServer;
use mdk::error::Error;
use mdk::suggestions;

use super::{confirm, Context};

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Instance to remove
    #[arg(value_name = "NAME")]
    pub name: String,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Execute the `remove` command.
pub fn execute(args: RemoveArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let instance = registry.get(&args.name)?;

    let prompt = format!(
        "Are you sure you want to remove {}? Its code, data and database will be deleted",
        instance.identifier()
    );
    if !args.yes && !confirm(&prompt, false)? {
        log::info!("Aborting");
        return Ok(());
    }

    let db = if instance.is_installed() {
        Some(ctx.database(instance.db_engine()?)?.1)
    } else {
        None
    };
    let identifier = instance.identifier().to_string();
    drop(instance);

    match registry.delete(&identifier, db.as_ref().map(|db| db as &dyn DatabaseServer)) {
        Ok(()) => {
            log::info!("{} has been removed", identifier);
            Ok(())
        }
        Err(Error::PermissionDenied { path, .. }) => {
            Err(suggestions::permission_denied(std::path::Path::new(&path)))
        }
        Err(e) => Err(e.into()),
    }
}
