//! # Tracker Command Implementation
//!
//! Shows an issue of the tracker, and optionally edits its labels or adds a
//! comment. The issue defaults to the one of the current branch.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use mdk::tracker::{normalize_issue_key, Attachment, Issue, IssueTracker, PullInfo, ALL_FIELDS};
use mdk::suggestions;

use super::Context;

#[derive(Args, Debug)]
pub struct TrackerArgs {
    /// Issue number or key; defaults to the issue of the current branch
    pub issue: Option<String>,

    /// Labels to add
    #[arg(long = "add-labels", value_name = "LABEL", num_args = 1..)]
    pub add_labels: Vec<String>,

    /// Labels to remove
    #[arg(long = "remove-labels", value_name = "LABEL", num_args = 1..)]
    pub remove_labels: Vec<String>,

    /// Add a comment
    #[arg(long, value_name = "TEXT")]
    pub comment: Option<String>,

    /// Print the issue as JSON
    #[arg(long)]
    pub json: bool,
}

/// What is shown of an issue.
#[derive(Debug, Serialize)]
struct IssueSummary {
    key: String,
    summary: Option<String>,
    status: Option<String>,
    assignee: Option<String>,
    labels: Vec<String>,
    security: bool,
    attachments: Vec<Attachment>,
    pull: PullInfo,
}

impl IssueSummary {
    fn new(issue: &Issue, fieldnames: &serde_json::Value) -> Self {
        Self {
            key: issue.key.clone(),
            summary: issue.summary().map(str::to_string),
            status: issue.status().map(str::to_string),
            assignee: issue.assignee().map(str::to_string),
            labels: issue.labels(),
            security: issue.is_security(),
            attachments: issue.attachments(),
            pull: PullInfo::from_issue(issue, fieldnames),
        }
    }

    fn lines(&self) -> Vec<(String, String)> {
        let none = || "-".to_string();
        let mut lines = vec![
            ("key".to_string(), self.key.clone()),
            ("summary".to_string(), self.summary.clone().unwrap_or_else(none)),
            ("status".to_string(), self.status.clone().unwrap_or_else(none)),
            ("assignee".to_string(), self.assignee.clone().unwrap_or_else(none)),
            (
                "labels".to_string(),
                if self.labels.is_empty() {
                    none()
                } else {
                    self.labels.join(", ")
                },
            ),
        ];
        if self.security {
            lines.push(("security".to_string(), "yes".to_string()));
        }
        if let Some(repository) = &self.pull.repository {
            lines.push(("repository".to_string(), repository.clone()));
        }
        for (version, pull) in &self.pull.branches {
            if let Some(branch) = &pull.branch {
                lines.push((format!("branch {}", version), branch.clone()));
            }
        }
        for attachment in &self.attachments {
            let created = attachment
                .created
                .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(none);
            lines.push((
                "attachment".to_string(),
                format!("{} ({} bytes, {})", attachment.filename, attachment.size, created),
            ));
        }
        lines
    }
}

/// Execute the `tracker` command.
pub fn execute(args: TrackerArgs, ctx: &Context) -> Result<()> {
    let key = match &args.issue {
        Some(issue) => normalize_issue_key(issue),
        None => issue_of_current_branch(ctx)?,
    };

    let editing =
        !args.add_labels.is_empty() || !args.remove_labels.is_empty() || args.comment.is_some();
    let tracker = if editing {
        ctx.authenticated_tracker()?
    } else {
        ctx.tracker()?
    };

    if !args.add_labels.is_empty() {
        let changes = tracker.add_labels(&key, &args.add_labels)?;
        log::info!("Labels added: {}", changes.changed.join(", "));
    }
    if !args.remove_labels.is_empty() {
        let changes = tracker.remove_labels(&key, &args.remove_labels)?;
        log::info!("Labels removed: {}", changes.changed.join(", "));
    }
    if let Some(comment) = &args.comment {
        tracker.add_comment(&key, comment)?;
        log::info!("Comment added to {}", key);
    }

    let issue = tracker.get_issue(&key, ALL_FIELDS)?;
    let fieldnames = ctx
        .config
        .get("tracker.fieldnames")
        .cloned()
        .unwrap_or_default();
    let summary = IssueSummary::new(&issue, &fieldnames);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for (key, value) in summary.lines() {
            println!("{}", ctx.output.key_value(&key, &value));
        }
    }
    Ok(())
}

fn issue_of_current_branch(ctx: &Context) -> Result<String> {
    let registry = ctx.registry()?;
    let instance = ctx.instance(&registry, None)?;
    let branch = instance.current_branch()?;
    instance
        .settings()
        .namer
        .parse(&branch)
        .map(|parsed| parsed.issue_key())
        .ok_or_else(|| suggestions::issue_not_given(&branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue() -> Issue {
        Issue::from_json(
            "MDL-1234",
            &json!({
                "key": "MDL-1234",
                "fields": {
                    "summary": "Fix the thing",
                    "status": {"name": "Open"},
                    "labels": ["triaged", "ui"],
                    "customfield_1": "https://git.example.com/me/moodle.git",
                    "customfield_2": "MDL-1234-main",
                    "attachment": [{
                        "id": "99",
                        "filename": "fix.patch",
                        "content": "https://tracker.example.com/99",
                        "size": 120,
                        "created": "2024-01-15T10:20:30.000+0000"
                    }]
                },
                "names": {
                    "customfield_1": "Pull from Repository",
                    "customfield_2": "Pull Main Branch"
                }
            }),
        )
    }

    fn fieldnames() -> serde_json::Value {
        json!({
            "repositoryurl": "Pull from Repository",
            "main": {"branch": "Pull Main Branch", "diffurl": "Pull Main Diff URL"}
        })
    }

    #[test]
    fn test_summary_lines() {
        let lines = IssueSummary::new(&issue(), &fieldnames()).lines();
        assert!(lines.contains(&("summary".to_string(), "Fix the thing".to_string())));
        assert!(lines.contains(&("assignee".to_string(), "-".to_string())));
        assert!(lines.contains(&("labels".to_string(), "triaged, ui".to_string())));
        assert!(lines.contains(&("branch main".to_string(), "MDL-1234-main".to_string())));
        assert!(lines.contains(&(
            "attachment".to_string(),
            "fix.patch (120 bytes, 2024-01-15 10:20)".to_string()
        )));
    }

    #[test]
    fn test_summary_json() {
        let value = serde_json::to_value(IssueSummary::new(&issue(), &fieldnames())).unwrap();
        assert_eq!(value["key"], "MDL-1234");
        assert_eq!(value["status"], "Open");
        assert_eq!(value["attachments"][0]["filename"], "fix.patch");
        assert_eq!(value["pull"]["repository"], "https://git.example.com/me/moodle.git");
        assert_eq!(value["pull"]["branches"]["main"]["branch"], "MDL-1234-main");
    }
}
