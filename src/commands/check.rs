//! # Check Command Implementation
//!
//! Looks for settings the user configuration has lost compared to the
//! distribution defaults, then for instances whose remotes do not point where
//! the configuration says they should. Problems are reported, never fixed.

use anyhow::Result;
use clap::Args;

use mdk::registry::InstanceFilter;

use super::Context;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Instances to check; defaults to every instance
    #[arg(value_name = "NAME")]
    pub names: Vec<String>,

    /// Check the integration instances
    #[arg(short, long, conflicts_with = "names")]
    pub integration: bool,

    /// Check the stable instances
    #[arg(short, long, conflicts_with = "names")]
    pub stable: bool,
}

/// Execute the `check` command.
pub fn execute(args: CheckArgs, ctx: &Context) -> Result<()> {
    println!("[Config file]");
    let missing = ctx.config.missing_dist_settings()?;
    if missing.is_empty() {
        println!("  All good!");
    }
    for key in &missing {
        println!("  Missing setting {}", key);
    }
    println!();

    let registry = ctx.registry()?;
    let instances = if args.names.is_empty() {
        let filter = match (args.integration, args.stable) {
            (true, false) => InstanceFilter::integration(),
            (false, true) => InstanceFilter::stable(),
            _ => InstanceFilter::all(),
        };
        let mut instances = Vec::new();
        for name in registry.list(filter)? {
            match registry.get(&name) {
                Ok(instance) => instances.push(instance),
                Err(e) => log::warn!("Skipping {}: {}", name, e),
            }
        }
        instances
    } else {
        registry.resolve_multiple(&args.names)?
    };

    if instances.is_empty() {
        println!("No instances to check.");
        return Ok(());
    }

    let mut clean = true;
    for instance in &instances {
        let problems = match registry.remote_problems(instance) {
            Ok(problems) => problems,
            Err(e) => vec![format!("Could not read the remotes: {}", e)],
        };
        if problems.is_empty() {
            continue;
        }
        clean = false;
        println!("[{}]", ctx.output.name(instance.identifier()));
        for problem in &problems {
            println!("  {}", problem);
        }
    }
    if clean {
        println!("All instances are good!");
    }
    Ok(())
}
