//! # Run Command Implementation
//!
//! Runs a helper script from the script directories in one or more
//! instances. Without a script name, lists the available scripts.

use anyhow::Result;
use clap::Args;

use mdk::batch::BatchReport;
use mdk::instance::Instance;
use mdk::scripts::ScriptLibrary;

use super::{finish_batch, Context, InstanceSelection};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script to run; lists the scripts when omitted
    pub script: Option<String>,

    #[command(flatten)]
    pub selection: InstanceSelection,

    /// Arguments passed to the script
    #[arg(
        short = 'g',
        long = "args",
        value_name = "ARG",
        num_args = 1..,
        allow_hyphen_values = true
    )]
    pub args: Vec<String>,
}

/// Execute the `run` command.
pub fn execute(args: RunArgs, ctx: &Context) -> Result<()> {
    let library = ScriptLibrary::from_config(&ctx.config);
    let Some(script) = args.script else {
        for (name, path) in library.list() {
            println!("{}", ctx.output.key_value(&name, &path.display().to_string()));
        }
        return Ok(());
    };
    // Fail early on unknown or ambiguous names.
    library.find(&script)?;

    let registry = ctx.registry()?;
    let mut report = BatchReport::new();
    for instance in args.selection.resolve(&registry, &mut report)? {
        log::info!("Running {} on {}", script, ctx.output.name(instance.identifier()));
        let result = instance
            .run_script(&library, &script, &args.args)
            .and_then(|output| check_exit(&script, output.code));
        report.record(instance.identifier(), result);
    }
    finish_batch(report)
}

/// Run `scripts` in order on `instance`, stopping at the first failure.
pub fn run_scripts(ctx: &Context, instance: &Instance, scripts: &[String]) -> Result<()> {
    if scripts.is_empty() {
        return Ok(());
    }
    let library = ScriptLibrary::from_config(&ctx.config);
    for script in scripts {
        log::info!("Running {} on {}", script, instance.identifier());
        let output = instance.run_script(&library, script, &[])?;
        check_exit(script, output.code)?;
    }
    Ok(())
}

fn check_exit(script: &str, code: i32) -> mdk::error::Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(mdk::error::Error::Process {
        command: script.to_string(),
        message: format!("exited with code {}", code),
    })
}
