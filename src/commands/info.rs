//! # Info Command Implementation
//!
//! Lists the instances of the storage root, or prints what is known about
//! one of them: derived facts (branch, version, installed...) merged with
//! the settings of its `config.php`.

use anyhow::Result;
use clap::Args;
use glob::Pattern;

use mdk::registry::InstanceFilter;
use mdk::suggestions;

use super::Context;

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Instance to describe; defaults to the current one
    #[arg(value_name = "NAME")]
    pub name: Option<String>,

    /// List the instances
    #[arg(short, long)]
    pub list: bool,

    /// Only list integration instances
    #[arg(short, long, requires = "list")]
    pub integration: bool,

    /// Only list stable instances
    #[arg(short, long, requires = "list")]
    pub stable: bool,

    /// Only list instances matching a glob pattern, e.g. "stable_4*"
    #[arg(short, long, value_name = "PATTERN", requires = "list")]
    pub pattern: Option<String>,

    /// Print a single value
    #[arg(short, long = "var", value_name = "KEY", conflicts_with = "list")]
    pub var: Option<String>,
}

/// Execute the `info` command.
pub fn execute(args: InfoArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;

    if args.list {
        let filter = match (args.integration, args.stable) {
            (true, false) => InstanceFilter::integration(),
            (false, true) => InstanceFilter::stable(),
            _ => InstanceFilter::all(),
        };
        let pattern = args.pattern.as_deref().map(Pattern::new).transpose()?;
        for name in registry.list(filter)? {
            if pattern.as_ref().map_or(true, |p| p.matches(&name)) {
                println!("{}", ctx.output.name(&name));
            }
        }
        return Ok(());
    }

    let instance = ctx.instance(&registry, args.name.as_deref())?;
    let info = instance.info();
    match args.var {
        Some(key) => match info.get(&key) {
            Some(value) => println!("{}", value),
            None => {
                let known: Vec<String> = info.keys().cloned().collect();
                return Err(suggestions::unknown_setting(&key, &known));
            }
        },
        None => {
            for (key, value) in &info {
                println!("{}", ctx.output.key_value(key, value));
            }
        }
    }
    Ok(())
}
