//! # Install Command Implementation
//!
//! Creates the database of an instance and runs the product's installer,
//! then optionally runs scripts on the fresh site.

use anyhow::Result;
use clap::Args;

use mdk::database::Engine;
use mdk::instance::{InstallOptions, Instance};
use mdk::registry::InstanceRegistry;

use super::Context;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Instance to install; defaults to the current one
    #[arg(value_name = "NAME")]
    pub name: Option<String>,

    /// Database engine (mysqli, mariadb, pgsql)
    #[arg(short, long)]
    pub engine: Option<String>,

    /// Full name of the site
    #[arg(short, long = "fullname")]
    pub fullname: Option<String>,

    /// Drop an existing database of the same name first
    #[arg(long)]
    pub drop_db: bool,

    /// Scripts to run once installed
    #[arg(short, long, value_name = "SCRIPT", num_args = 1..)]
    pub run: Vec<String>,
}

/// Execute the `install` command.
pub fn execute(args: InstallArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let mut instance = ctx.instance(&registry, args.name.as_deref())?;
    let engine = ctx.engine(args.engine.as_deref())?;

    install(ctx, &registry, &mut instance, engine, args.fullname, args.drop_db)?;
    super::run::run_scripts(ctx, &instance, &args.run)
}

/// Install `instance` on `engine`, serving it from the registry's URL.
pub fn install(
    ctx: &Context,
    registry: &InstanceRegistry,
    instance: &mut Instance,
    engine: Engine,
    full_name: Option<String>,
    drop_db: bool,
) -> Result<()> {
    let (profile, db) = ctx.database(engine)?;
    let wwwroot = registry.url_of(instance.identifier());
    log::info!(
        "Installing {} on {}",
        ctx.output.name(instance.identifier()),
        engine.wording()
    );
    instance.install(InstallOptions {
        db: &db,
        profile: &profile,
        db_name: None,
        data_dir: None,
        full_name,
        drop_db,
        wwwroot,
    })?;
    log::info!("{} is installed", instance.identifier());
    Ok(())
}
