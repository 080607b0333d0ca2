//! # Push Command Implementation
//!
//! Pushes an issue branch to the developer's remote and, on request, records
//! it on the tracker issue. Security issues are never pushed: their work is
//! uploaded to the tracker as a patch file instead.

use anyhow::{bail, Result};
use clap::Args;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

use mdk::branch::issue_from_commit_message;
use mdk::config::Config;
use mdk::error::Error;
use mdk::instance::Instance;
use mdk::tracker::IssueTracker;

use super::{confirm, Context};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Instance to push from; defaults to the current one
    #[arg(value_name = "NAME")]
    pub name: Option<String>,

    /// Branch to push; defaults to the current branch
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Remote to push to; defaults to the `myRemote` setting
    #[arg(short, long)]
    pub remote: Option<String>,

    /// Force the push
    #[arg(short, long)]
    pub force: bool,

    /// Upload a patch to the tracker instead of pushing
    #[arg(short, long)]
    pub patch: bool,

    /// Record the branch and its diff URL on the tracker issue
    #[arg(short = 't', long)]
    pub update_tracker: bool,

    /// Also push the stable branch
    #[arg(short = 's', long)]
    pub include_stable: bool,

    /// Force the push of the stable branch
    #[arg(short = 'k', long, requires = "include_stable")]
    pub force_stable: bool,
}

/// Execute the `push` command.
pub fn execute(args: PushArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let instance = ctx.instance(&registry, args.name.as_deref())?;
    let git = instance.git();

    let branch = match args.branch {
        Some(branch) => branch,
        None => instance.current_branch()?,
    };
    let remote = args
        .remote
        .unwrap_or_else(|| instance.settings().my_remote.clone());
    let issue = instance
        .settings()
        .namer
        .parse(&branch)
        .map(|parsed| parsed.issue_key());

    if let Some(issue) = &issue {
        let last_message = git
            .messages(Some(branch.as_str()), 1)?
            .into_iter()
            .next()
            .unwrap_or_default();
        if !commit_references(&last_message, issue)
            && !confirm(
                &format!(
                    "The last commit of {} does not start with {}. Are you sure you want to continue?",
                    branch, issue
                ),
                false,
            )?
        {
            log::info!("Aborting");
            return Ok(());
        }
    }

    let mut patch = args.patch;
    if let Some(issue) = &issue {
        if !patch && ctx.tracker()?.is_security_issue(issue)? {
            log::warn!("{} is a security issue, uploading a patch instead of pushing", issue);
            patch = true;
        }
    }

    if patch {
        let Some(issue) = &issue else {
            bail!(Error::BranchNotParsed { branch });
        };
        let tracker = ctx.authenticated_tracker()?;
        return upload_patch(&tracker, &instance, &branch, issue);
    }

    log::info!("Pushing {} to {}", ctx.output.name(&branch), remote);
    push_branch(&instance, &remote, &branch, args.force)?;

    if args.include_stable {
        let stable = instance.stable_branch().to_string();
        log::info!("Pushing {} to {}", ctx.output.name(&stable), remote);
        push_branch(&instance, &remote, &stable, args.force_stable)?;
    }

    if args.update_tracker {
        let Some(issue) = &issue else {
            bail!(Error::BranchNotParsed { branch });
        };
        let repository = match ctx.config.get_str("repositoryUrl").filter(|u| !u.is_empty()) {
            Some(url) => url.to_string(),
            None => git.get_remote(&remote)?.unwrap_or_default(),
        };
        let head = instance.head_commit(None)?;
        let version = instance.branch().to_string();
        let updates = tracker_updates(&ctx.config, &version, &branch, &head, &repository);
        if updates.is_empty() {
            log::warn!("No tracker fields are configured for version {}", version);
        } else {
            ctx.authenticated_tracker()?.set_custom_fields(issue, &updates)?;
            log::info!("Updated the pull fields of {}", issue);
        }
    }
    Ok(())
}

fn push_branch(instance: &Instance, remote: &str, branch: &str, force: bool) -> Result<()> {
    let output = instance.git().push(remote, branch, force)?;
    if !output.success() {
        return Err(Error::GitCommand {
            command: format!("git push {} {}", remote, branch),
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Whether a commit message starts with `issue`.
fn commit_references(message: &str, issue: &str) -> bool {
    issue_from_commit_message(message).is_some_and(|found| found.eq_ignore_ascii_case(issue))
}

/// Create a patch of `branch` against the upstream stable branch and attach it to `issue`.
pub fn upload_patch(
    tracker: &dyn IssueTracker,
    instance: &Instance,
    branch: &str,
    issue: &str,
) -> Result<()> {
    let file = instance.path().join(format!("{}.patch", branch));
    let range = format!("{}..{}", instance.upstream_stable_ref(), branch);
    instance.git().create_patch(&range, &file)?;

    log::info!("Uploading {} to {}", file.display(), issue);
    let uploaded = tracker.upload(issue, &file);
    if let Err(e) = fs::remove_file(&file) {
        log::debug!("Could not remove {}: {}", file.display(), e);
    }
    uploaded?;
    Ok(())
}

/// Tracker field values recording `branch` for `version`, keyed by field name.
fn tracker_updates(
    config: &Config,
    version: &str,
    branch: &str,
    head_commit: &str,
    repository: &str,
) -> BTreeMap<String, String> {
    let mut updates = BTreeMap::new();
    let Some(fields) = config.get(&format!("tracker.fieldnames.{}", version)) else {
        return updates;
    };

    if let Some(name) = config.get_str("tracker.fieldnames.repositoryurl") {
        if !repository.is_empty() {
            updates.insert(name.to_string(), repository.to_string());
        }
    }
    if let Some(name) = fields.get("branch").and_then(Value::as_str) {
        updates.insert(name.to_string(), branch.to_string());
    }
    if let (Some(name), Some(template)) = (
        fields.get("diffurl").and_then(Value::as_str),
        config.get_str("diffUrlTemplate"),
    ) {
        let url = template
            .replace("%headcommit%", head_commit)
            .replace("%branch%", branch);
        updates.insert(name.to_string(), url);
    }
    updates
}
