//! # Backport Command Implementation
//!
//! Cherry-picks the commits of an issue branch onto the matching branch of
//! the instances of other versions. The commits are those of the branch
//! missing from the upstream stable branch of the source instance.

use anyhow::{bail, Result};
use clap::Args;

use mdk::backport::{
    commits_to_backport, BackportOutcome, BackportSettings, BackportSource, Backporter,
    ConflictPrompt, PushTarget,
};
use mdk::batch::BatchReport;
use mdk::branch::normalize_version;
use mdk::error::Error;
use mdk::tracker::IssueTracker;

use super::{confirm, finish_batch, Context};

#[derive(Args, Debug)]
pub struct BackportArgs {
    /// Source instance; defaults to the current one
    #[arg(value_name = "NAME")]
    pub name: Option<String>,

    /// Branch to backport; defaults to the current branch
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Versions to backport to, e.g. `404 405`
    #[arg(short, long = "versions", value_name = "VERSION", num_args = 1.., required = true)]
    pub versions: Vec<String>,

    /// Backport to the integration instances
    #[arg(short, long)]
    pub integration: bool,

    /// Push the backported branches
    #[arg(short, long)]
    pub push: bool,

    /// Remote to push to; defaults to the `myRemote` setting
    #[arg(long, value_name = "REMOTE", requires = "push")]
    pub push_to: Option<String>,

    /// Force the push
    #[arg(short, long = "force-push", requires = "push")]
    pub force_push: bool,
}

/// Asks on the terminal, aborting when the question cannot be asked.
struct AskAbort;

impl ConflictPrompt for AskAbort {
    fn abort_cherry_pick(&self, target: &str) -> bool {
        confirm(
            &format!("The cherry-pick onto {} has conflicts. Abort it?", target),
            true,
        )
        .unwrap_or(true)
    }
}

/// Execute the `backport` command.
pub fn execute(args: BackportArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let source = ctx.instance(&registry, args.name.as_deref())?;
    let branch = match args.branch {
        Some(branch) => branch,
        None => source.current_branch()?,
    };
    let Some(parsed) = source.settings().namer.parse(&branch) else {
        bail!(Error::BranchNotParsed { branch });
    };
    let issue = parsed.issue_key();

    let hashes = commits_to_backport(
        source.git(),
        &source.settings().upstream_remote,
        source.stable_branch(),
        &branch,
    )?;
    if hashes.is_empty() {
        bail!(
            "{} has no commits missing from {}",
            branch,
            source.upstream_stable_ref()
        );
    }
    log::info!("Backporting {} commit(s) of {}", hashes.len(), ctx.output.name(&branch));

    // Security issues are shared as patches, never pushed.
    let mut push = args.push.then(|| PushTarget {
        remote: args
            .push_to
            .clone()
            .unwrap_or_else(|| source.settings().my_remote.clone()),
        force: args.force_push,
    });
    let mut upload_to = None;
    if push.is_some() && ctx.tracker()?.is_security_issue(&issue)? {
        log::warn!("{} is a security issue, uploading patches instead of pushing", issue);
        push = None;
        upload_to = Some(ctx.authenticated_tracker()?);
    }

    let backporter = Backporter::new(BackportSettings::from_config(&ctx.config), &AskAbort);
    let backport_source = BackportSource {
        path: source.path(),
        branch: &branch,
        issue: &parsed.issue,
        suffix: parsed.suffix.as_deref(),
        hashes: &hashes,
    };
    let own_version = source.branch().to_string();

    let mut report = BatchReport::new();
    for version in &args.versions {
        let version = normalize_version(version);
        if version == own_version {
            log::info!("Skipping version {}, it is the source's", version);
            continue;
        }
        let name = registry.generate_instance_name(&version, args.integration, None, None);
        let target = match registry.resolve(Some(&name), None) {
            Ok(Some(target)) => target,
            Ok(None) => {
                log::error!("Could not find instance {} for version {}", name, version);
                report.fail(&name, "no such instance");
                continue;
            }
            Err(e) => {
                report.record(&name, Err(e));
                continue;
            }
        };

        log::info!("Backporting to {}", ctx.output.name(&name));
        match backporter.backport_to(&target, &backport_source, push.as_ref()) {
            Ok(BackportOutcome::Picked { branch, .. }) => {
                let uploaded = match &upload_to {
                    Some(tracker) => super::push::upload_patch(tracker, &target, &branch, &issue),
                    None => Ok(()),
                };
                match uploaded {
                    Ok(()) => report.record(&name, Ok(())),
                    Err(e) => report.fail(&name, format!("{:#}", e)),
                }
            }
            Ok(BackportOutcome::Conflict { branch, aborted }) => {
                let state = if aborted { "aborted" } else { "left in progress" };
                report.fail(&name, format!("conflicts on {}, cherry-pick {}", branch, state));
            }
            Err(e) => report.record(&name, Err(e)),
        }
    }
    finish_batch(report)
}
