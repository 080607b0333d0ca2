//! # Pull Command Implementation
//!
//! Brings the work attached to a tracker issue into the current instance.
//! The issue's repository and branch fields are used when they are set for
//! the instance's version; otherwise the `.patch` attachments are applied.
//!
//! ## Modes
//!
//! - **pull** (default): merge into the current branch
//! - **fetch**: fetch or download only
//! - **checkout**: reset a dedicated `-nomerge` branch to the work
//! - **integration**: merge into the stable branch
//! - **testing**: reset a new `-test` branch to the work

use anyhow::Result;
use clap::Args;
use dialoguer::{theme::ColorfulTheme, MultiSelect};

use mdk::error::Error;
use mdk::fetch::{FetchExecutor, FetchMode, FetchPlanner, FetchSource, PatchSelector};
use mdk::suggestions;
use mdk::tracker::{normalize_issue_key, Attachment};

use super::Context;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Issue number or key; defaults to the issue of the current branch
    pub issue: Option<String>,

    /// How to bring the work in (pull, fetch, checkout, integration, testing)
    #[arg(short, long, value_name = "MODE")]
    pub mode: Option<String>,

    /// Only fetch the work, shorthand for `--mode fetch`
    #[arg(long, conflicts_with_all = ["mode", "no_merge", "testing", "integration"])]
    pub fetch_only: bool,

    /// Check out the work on its own branch, shorthand for `--mode checkout`
    #[arg(short, long, conflicts_with_all = ["mode", "testing", "integration"])]
    pub no_merge: bool,

    /// Check out the work on a new testing branch, shorthand for `--mode testing`
    #[arg(short, long, conflicts_with_all = ["mode", "integration"])]
    pub testing: bool,

    /// Merge the work into the stable branch, shorthand for `--mode integration`
    #[arg(short, long, conflicts_with = "mode")]
    pub integration: bool,

    /// List the patches even when a branch is available
    #[arg(short, long)]
    pub prompt: bool,
}

impl PullArgs {
    fn fetch_mode(&self) -> Result<FetchMode> {
        if let Some(mode) = &self.mode {
            return Ok(mode.parse()?);
        }
        Ok(if self.fetch_only {
            FetchMode::FetchOnly
        } else if self.no_merge {
            FetchMode::Checkout
        } else if self.testing {
            FetchMode::Testing
        } else if self.integration {
            FetchMode::Integration
        } else {
            FetchMode::Pull
        })
    }
}

/// Asks which patches to apply, in the listed order.
struct PromptSelector;

impl PatchSelector for PromptSelector {
    fn select(&self, issue: &str, candidates: &[Attachment]) -> mdk::error::Result<Vec<usize>> {
        let items: Vec<String> = candidates.iter().map(describe).collect();
        MultiSelect::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Patches of {} to apply", issue))
            .items(&items)
            .interact()
            .map_err(|e| Error::Process {
                command: "prompt".to_string(),
                message: e.to_string(),
            })
    }
}

fn describe(attachment: &Attachment) -> String {
    let mut text = attachment.filename.clone();
    if let Some(author) = &attachment.author {
        text.push_str(&format!(" by {}", author));
    }
    if let Some(created) = attachment.created {
        text.push_str(&format!(" on {}", created.format("%Y-%m-%d %H:%M")));
    }
    text
}

/// Execute the `pull` command.
pub fn execute(args: PullArgs, ctx: &Context) -> Result<()> {
    let mode = args.fetch_mode()?;
    let registry = ctx.registry()?;
    let instance = ctx.instance(&registry, None)?;

    let issue = match &args.issue {
        Some(issue) => normalize_issue_key(issue),
        None => {
            let branch = instance.current_branch()?;
            instance
                .settings()
                .namer
                .parse(&branch)
                .map(|parsed| parsed.issue_key())
                .ok_or_else(|| suggestions::issue_not_given(&branch))?
        }
    };
    let version = instance.branch().to_string();

    let tracker = ctx.tracker()?;
    let planner = FetchPlanner::new(&tracker);
    let plan = planner.plan(&issue, &version, args.prompt, &PromptSelector)?;
    match &plan.source {
        FetchSource::Remote { url, reference } => {
            log::info!("Pulling {} from {} {}", issue, url, reference);
        }
        FetchSource::Patches(patches) => {
            log::info!("Applying {} patch(es) of {}", patches.len(), issue);
        }
    }

    let mut executor = FetchExecutor::new(&instance, &tracker);
    let outcome = executor.run(&plan, mode)?;
    for file in &outcome.downloaded {
        println!("{}", file.display());
    }
    log::info!(
        "{} is on {}",
        instance.identifier(),
        ctx.output.name(&outcome.branch)
    );
    Ok(())
}
