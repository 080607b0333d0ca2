//! Cherry-picking a branch onto other stable versions.
//!
//! The commits of the source branch that are not yet in its upstream stable
//! branch are picked, oldest first, onto a branch of the same issue in each
//! target instance. The target's local changes, untracked files included, are
//! stashed around the pick.

use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::git::{CherryPick, GitOperations, StashOutcome};
use crate::instance::Instance;
use crate::process::CommandSpec;

pub const DEFAULT_GENERATED_STYLESHEET: &str = "theme/bootstrapbase/style/moodle.css";
pub const DEFAULT_STYLESHEET_COMPILE: &str = "grunt css";
const MERGE_MSG: &str = ".git/MERGE_MSG";
/// `git cherry-pick --abort` exits with this when no pick is in progress.
const NOTHING_TO_ABORT: i32 = 128;

/// Commits of `branch` missing from `upstream/stable`, oldest first.
pub fn commits_to_backport(
    git: &dyn GitOperations,
    upstream_remote: &str,
    stable_branch: &str,
    branch: &str,
) -> Result<Vec<String>> {
    let range = format!("{}/{}..{}", upstream_remote, stable_branch, branch);
    let mut hashes = git.hashes(&range, None)?;
    hashes.reverse();
    Ok(hashes)
}

/// Asks whether a cherry-pick left in progress should be aborted.
pub trait ConflictPrompt {
    fn abort_cherry_pick(&self, target: &str) -> bool;
}

/// Answers every prompt the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl ConflictPrompt for FixedAnswer {
    fn abort_cherry_pick(&self, _target: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackportSettings {
    /// A generated file whose conflicts are resolved by recompiling it.
    pub generated_stylesheet: String,
    /// Command regenerating the stylesheet, run from the code directory.
    /// `None` turns the automatic resolution off.
    pub stylesheet_compile: Option<Vec<String>>,
}

impl BackportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            generated_stylesheet: config
                .get_str("backport.generatedStylesheet")
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_GENERATED_STYLESHEET)
                .to_string(),
            stylesheet_compile: compile_command(
                config
                    .get_str("backport.stylesheetCompile")
                    .unwrap_or(DEFAULT_STYLESHEET_COMPILE),
            ),
        }
    }
}

impl Default for BackportSettings {
    fn default() -> Self {
        Self {
            generated_stylesheet: DEFAULT_GENERATED_STYLESHEET.to_string(),
            stylesheet_compile: compile_command(DEFAULT_STYLESHEET_COMPILE),
        }
    }
}

/// An empty command disables the compilation.
fn compile_command(command: &str) -> Option<Vec<String>> {
    let words: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    (!words.is_empty()).then_some(words)
}

/// What to pick and where it comes from.
#[derive(Debug, Clone)]
pub struct BackportSource<'a> {
    /// Code directory of the source instance, fetched from as a remote.
    pub path: &'a Path,
    pub branch: &'a str,
    pub issue: &'a str,
    pub suffix: Option<&'a str>,
    /// Commits to pick, oldest first.
    pub hashes: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub remote: String,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackportOutcome {
    Picked { branch: String, pushed: bool },
    /// The pick stopped on conflicts. The stash is popped only if the pick was aborted.
    Conflict { branch: String, aborted: bool },
}

pub struct Backporter<'a> {
    settings: BackportSettings,
    prompt: &'a dyn ConflictPrompt,
}

impl<'a> Backporter<'a> {
    pub fn new(settings: BackportSettings, prompt: &'a dyn ConflictPrompt) -> Self {
        Self { settings, prompt }
    }

    /// Pick `source` onto its issue branch in `target`, optionally pushing it.
    pub fn backport_to(
        &self,
        target: &Instance,
        source: &BackportSource<'_>,
        push: Option<&PushTarget>,
    ) -> Result<BackportOutcome> {
        let git = target.git();
        let stashed = match git.stash_save(true)? {
            StashOutcome::Stashed => {
                log::info!("Stashed your local changes");
                true
            }
            StashOutcome::NoLocalChanges => false,
        };

        let branch = target.generate_branch_name(source.issue, source.suffix, None);
        if let Err(e) = self.prepare_branch(target, source, &branch) {
            pop_stash(git, stashed);
            return Err(e);
        }

        log::info!("Cherry-picking {} commit(s) onto {}", source.hashes.len(), branch);
        let picked = git.cherry_pick(CherryPick::Commits(source.hashes))?;
        if !picked.success() && !self.resolve_conflicts(target, source.hashes.len())? {
            log::error!("Error while cherry-picking in {}", target.identifier());
            log::debug!("{}", picked.stderr);
            let mut aborted = false;
            if self.prompt.abort_cherry_pick(target.identifier()) {
                let abort = git.cherry_pick(CherryPick::Abort)?;
                if abort.code > 0 && abort.code != NOTHING_TO_ABORT {
                    log::error!("Could not abort the cherry-pick");
                } else {
                    aborted = true;
                    pop_stash(git, stashed);
                }
            } else if stashed {
                log::warn!("Your local changes were left in the stash");
            }
            return Ok(BackportOutcome::Conflict { branch, aborted });
        }

        let mut pushed = false;
        if let Some(push) = push {
            log::info!("Pushing {} to {}", branch, push.remote);
            let result = git.push(&push.remote, &branch, push.force)?;
            if result.success() {
                pushed = true;
            } else {
                log::warn!("Error while pushing to remote {}", push.remote);
                log::debug!("{}", result.stderr);
            }
        }

        pop_stash(git, stashed);
        log::info!("Instance {} successfully patched", target.identifier());
        Ok(BackportOutcome::Picked { branch, pushed })
    }

    fn prepare_branch(
        &self,
        target: &Instance,
        source: &BackportSource<'_>,
        branch: &str,
    ) -> Result<()> {
        let git = target.git();
        log::info!("Fetching {} from {}", source.branch, source.path.display());
        git.fetch(&source.path.to_string_lossy(), Some(source.branch))?;

        let track = target.upstream_stable_ref();
        if git.has_branch(branch, None)? {
            git.checkout(branch)?;
            log::info!("Hard reset {} to {}", branch, track);
            git.reset(&track, true)
        } else {
            log::info!("Creating branch {}", branch);
            git.create_branch(branch, Some(&track)).map_err(|e| Error::GitCommand {
                command: format!("git branch --track {} {}", branch, track),
                stderr: e.to_string(),
            })?;
            git.checkout(branch)
        }
    }

    /// Keep resolving while the only conflict is the generated stylesheet.
    fn resolve_conflicts(&self, target: &Instance, max_rounds: usize) -> Result<bool> {
        let Some(compile) = &self.settings.stylesheet_compile else {
            return Ok(false);
        };
        let git = target.git();
        for _ in 0..max_rounds.max(1) {
            let conflicts = git.conflicting_files()?;
            if conflicts.len() != 1 || conflicts[0] != self.settings.generated_stylesheet {
                return Ok(false);
            }
            log::info!(
                "Conflicts found in {}, trying to auto resolve",
                self.settings.generated_stylesheet
            );
            let Some((program, args)) = compile.split_first() else {
                return Ok(false);
            };
            let spec = CommandSpec::new(program)
                .args(args.iter().cloned())
                .cwd(target.path());
            if !target.runner().exec(&spec)?.success() {
                log::warn!("Could not compile {}", self.settings.generated_stylesheet);
                return Ok(false);
            }
            git.add(&self.settings.generated_stylesheet)?;
            git.commit_with_message_file(&target.path().join(MERGE_MSG))?;
            if git.cherry_pick(CherryPick::Continue)?.success() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn pop_stash(git: &dyn GitOperations, stashed: bool) {
    if !stashed {
        return;
    }
    match git.stash_pop() {
        Ok(()) => log::info!("Popped the stash"),
        Err(e) => log::error!("An error occurred while unstashing your changes: {}", e),
    }
}
