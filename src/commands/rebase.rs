//! # Rebase Command Implementation
//!
//! Rebases the branches of several issues on the latest upstream stable
//! branch of each selected instance. A conflicting rebase is aborted and the
//! next issue is processed.

use anyhow::Result;
use clap::Args;

use mdk::batch::BatchReport;
use mdk::branch::{normalize_issue, normalize_version};
use mdk::error::Error;
use mdk::git::StashOutcome;
use mdk::instance::Instance;
use mdk::registry::InstanceRegistry;
use mdk::suggestions;

use super::{finish_batch, Context};

#[derive(Args, Debug)]
pub struct RebaseArgs {
    /// Instances to work on; defaults to the current one
    #[arg(value_name = "NAME", conflicts_with = "versions")]
    pub names: Vec<String>,

    /// Issues whose branches are rebased
    #[arg(short, long = "issues", value_name = "ISSUE", num_args = 1.., required = true)]
    pub issues: Vec<String>,

    /// Suffix of the branches
    #[arg(short, long)]
    pub suffix: Option<String>,

    /// Work on the stable instances of these versions
    #[arg(short, long = "versions", value_name = "VERSION", num_args = 1..)]
    pub versions: Vec<String>,

    /// Push the rebased branches
    #[arg(short, long)]
    pub push: bool,

    /// Remote to push to; defaults to the `myRemote` setting
    #[arg(short, long, requires = "push")]
    pub remote: Option<String>,

    /// Force the push
    #[arg(short, long = "force-push", requires = "push")]
    pub force_push: bool,
}

fn select(args: &RebaseArgs, registry: &InstanceRegistry) -> Result<Vec<Instance>> {
    if args.versions.is_empty() {
        let instances = registry.resolve_multiple(&args.names)?;
        if instances.is_empty() {
            return Err(suggestions::instance_not_resolved(
                args.names.first().map(String::as_str),
            ));
        }
        return Ok(instances);
    }
    let names: Vec<String> = args
        .versions
        .iter()
        .map(|v| registry.generate_instance_name(&normalize_version(v), false, None, None))
        .collect();
    Ok(registry.resolve_multiple(&names)?)
}

/// Execute the `rebase` command.
pub fn execute(args: RebaseArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let mut report = BatchReport::new();

    for instance in select(&args, &registry)? {
        let git = instance.git();
        log::info!("Working on {}", ctx.output.name(instance.identifier()));
        let prepared = instance.current_branch().and_then(|previous| {
            let stashed = git.stash_save(false)? == StashOutcome::Stashed;
            git.fetch(&instance.settings().upstream_remote, None)?;
            Ok((previous, stashed))
        });
        let (previous, stashed) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                report.record(instance.identifier(), Err(e));
                continue;
            }
        };

        let remote = args
            .remote
            .clone()
            .unwrap_or_else(|| instance.settings().my_remote.clone());
        for issue in &args.issues {
            let branch = instance.generate_branch_name(
                &normalize_issue(issue),
                args.suffix.as_deref(),
                None,
            );
            let label = format!("{}/{}", instance.identifier(), branch);
            let push = args.push.then_some((remote.as_str(), args.force_push));
            let result = rebase_one(&instance, &branch, push);
            report.record(&label, result);
        }

        if let Err(e) = git.checkout(&previous) {
            log::warn!("Could not check out {} again: {}", previous, e);
        }
        if stashed {
            if let Err(e) = git.stash_pop() {
                log::warn!(
                    "Your local changes are still in the stash of {}: {}",
                    instance.identifier(),
                    e
                );
            }
        }
    }
    finish_batch(report)
}

fn rebase_one(
    instance: &Instance,
    branch: &str,
    push: Option<(&str, bool)>,
) -> mdk::error::Result<()> {
    let git = instance.git();
    if !git.has_branch(branch, None)? {
        return Err(Error::GitCommand {
            command: format!("git rev-parse --verify {}", branch),
            stderr: format!("{} has no branch {}", instance.identifier(), branch),
        });
    }

    let base = instance.upstream_stable_ref();
    log::info!("Rebasing {} on {}", branch, base);
    let output = git.rebase(&base, branch)?;
    if !output.success() {
        log::error!("Conflicts while rebasing {}, aborting", branch);
        git.rebase_abort()?;
        return Err(Error::GitCommand {
            command: format!("git rebase {} {}", base, branch),
            stderr: output.stderr.trim().to_string(),
        });
    }

    if let Some((remote, force)) = push {
        log::info!("Pushing {} to {}", branch, remote);
        let output = git.push(remote, branch, force)?;
        if !output.success() {
            return Err(Error::GitCommand {
                command: format!("git push {} {}", remote, branch),
                stderr: output.stderr.trim().to_string(),
            });
        }
    }
    Ok(())
}
