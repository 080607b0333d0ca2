//! # Fix Command Implementation
//!
//! Checks out the branch of an issue, creating it on top of the instance's
//! upstream stable branch the first time.

use anyhow::Result;
use clap::Args;

use super::Context;

#[derive(Args, Debug)]
pub struct FixArgs {
    /// Issue number or key
    #[arg(value_name = "ISSUE")]
    pub issue: String,

    /// Suffix appended to the branch name
    #[arg(value_name = "SUFFIX")]
    pub suffix: Option<String>,

    /// Instance to work in; defaults to the current one
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Execute the `fix` command.
pub fn execute(args: FixArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let instance = ctx.instance(&registry, args.name.as_deref())?;
    let branch = instance.checkout_issue_branch(&args.issue, args.suffix.as_deref())?;
    println!("{}", ctx.output.name(&branch));
    Ok(())
}
