//! # Create Command Implementation
//!
//! Creates one instance per requested version and suffix, cloning from the
//! cached mirrors, and optionally installs it and runs scripts on it.

use anyhow::Result;
use clap::Args;

use mdk::batch::BatchReport;
use mdk::branch::{normalize_version, MAIN_BRANCH};
use mdk::registry::CreateOptions;

use super::{finish_batch, Context};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Versions to create, e.g. `405` or `main`
    #[arg(
        short,
        long = "version",
        value_name = "VERSION",
        num_args = 1..,
        default_value = MAIN_BRANCH
    )]
    pub versions: Vec<String>,

    /// Suffixes appended to the instance names
    #[arg(short, long = "suffix", value_name = "SUFFIX", num_args = 1..)]
    pub suffixes: Vec<String>,

    /// Create integration instances
    #[arg(short = 't', long)]
    pub integration: bool,

    /// Name of the instance, instead of the generated one
    #[arg(short = 'n', long)]
    pub identifier: Option<String>,

    /// Install the instances once created
    #[arg(short, long)]
    pub install: bool,

    /// Database engine used to install
    #[arg(short, long, requires = "install")]
    pub engine: Option<String>,

    /// Scripts to run once installed
    #[arg(short, long, value_name = "SCRIPT", num_args = 1.., requires = "install")]
    pub run: Vec<String>,
}

/// Every version paired with every suffix; no suffix is a single unsuffixed pass.
fn combinations(args: &CreateArgs) -> Vec<CreateOptions> {
    let suffixes: Vec<Option<String>> = if args.suffixes.is_empty() {
        vec![None]
    } else {
        args.suffixes.iter().cloned().map(Some).collect()
    };
    args.versions
        .iter()
        .flat_map(|version| {
            suffixes.iter().map(move |suffix| CreateOptions {
                version: normalize_version(version),
                integration: args.integration,
                suffix: suffix.clone(),
                identifier: args.identifier.clone(),
            })
        })
        .collect()
}

/// Execute the `create` command.
pub fn execute(args: CreateArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let engine = if args.install {
        Some(ctx.engine(args.engine.as_deref())?)
    } else {
        None
    };

    let mut report = BatchReport::new();
    for options in combinations(&args) {
        let name = registry.generate_instance_name(
            &options.version,
            options.integration,
            options.suffix.as_deref(),
            options.identifier.as_deref(),
        );
        log::info!("Creating instance {}", ctx.output.name(&name));

        let mut instance = match registry.create(&options) {
            Ok(instance) => instance,
            Err(e) => {
                report.record(&name, Err(e));
                continue;
            }
        };
        let Some(engine) = engine else {
            report.record(&name, Ok(()));
            continue;
        };
        let installed = super::install::install(ctx, &registry, &mut instance, engine, None, false)
            .and_then(|()| super::run::run_scripts(ctx, &instance, &args.run));
        match installed {
            Ok(()) => report.record(&name, Ok(())),
            Err(e) => {
                log::error!("{}: {:#}", name, e);
                report.fail(&name, format!("{:#}", e));
            }
        }
    }
    finish_batch(report)
}
