//! # Fetching tracker branches
//!
//! Pulling the work attached to a tracker issue happens in two steps.
//!
//! [`FetchPlanner`] resolves the issue into a [`FetchPlan`]: either a remote
//! repository and branch read from the issue's pull fields for the target
//! version, or a selection of `.patch` attachments when those fields are
//! incomplete.
//!
//! [`FetchExecutor`] then carries the plan out in one of the [`FetchMode`]s,
//! inside a stash cycle unless it only fetches. Its progress is tracked by
//! [`FetchState`], and every transition is checked against
//! [`FetchState::can_advance_to`]:
//!
//! ```text
//! Idle -> Stashed -> Fetching -> Merging -------> Done -> Unstashed
//!                       |  \---> HardResetting -/
//!                       \------> PatchApplying -/
//! ```
//!
//! Any working step may end in `Failed`, and so may `Done` when the stash
//! cannot be popped. Merging may also end in `ConflictPending`, which leaves
//! the stash in place so the user's changes are not mixed into a conflicted
//! tree.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::git::{GitOperations, PatchOutcome, StashOutcome};
use crate::instance::Instance;
use crate::tracker::{normalize_issue_key, Attachment, Issue, IssueTracker, PullInfo, ALL_FIELDS};

/// Upper bound of the `test`, `test2`, ... branch name search.
pub const MAX_BRANCH_SUFFIX_ATTEMPTS: usize = 1000;

pub const TESTING_SUFFIX: &str = "test";
pub const NO_MERGE_SUFFIX: &str = "nomerge";
const FETCH_HEAD: &str = "FETCH_HEAD";

/// What to fetch. Never both a remote and patches.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchSource {
    Remote { url: String, reference: String },
    Patches(Vec<Attachment>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    /// Tracker key, e.g. `MDL-1234`.
    pub issue: String,
    /// Version whose branch is fetched, also used to name created branches.
    pub version: String,
    pub source: FetchSource,
}

/// Chooses which patches to apply when several are attached.
pub trait PatchSelector {
    /// Indices into `candidates`, in the order the patches should be applied.
    fn select(&self, issue: &str, candidates: &[Attachment]) -> Result<Vec<usize>>;
}

/// Selects every candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPatches;

impl PatchSelector for AllPatches {
    fn select(&self, _issue: &str, candidates: &[Attachment]) -> Result<Vec<usize>> {
        Ok((0..candidates.len()).collect())
    }
}

/// Resolves issues into fetch plans, memoising each issue for the run.
pub struct FetchPlanner<'a> {
    tracker: &'a dyn IssueTracker,
    issues: RefCell<HashMap<String, Issue>>,
}

impl<'a> FetchPlanner<'a> {
    pub fn new(tracker: &'a dyn IssueTracker) -> Self {
        Self {
            tracker,
            issues: RefCell::new(HashMap::new()),
        }
    }

    /// The issue, requested from the tracker at most once per key.
    fn issue(&self, key: &str) -> Result<Issue> {
        if let Some(issue) = self.issues.borrow().get(key) {
            return Ok(issue.clone());
        }
        let issue = self.tracker.get_issue(key, ALL_FIELDS)?;
        self.issues.borrow_mut().insert(key.to_string(), issue.clone());
        Ok(issue)
    }

    pub fn pull_info(&self, issue: &str) -> Result<PullInfo> {
        let issue = self.issue(&normalize_issue_key(issue))?;
        Ok(self.tracker.pull_info_of(&issue))
    }

    /// Plan the fetch of `issue` for `version`.
    ///
    /// Without `force_patches`, the issue's repository and branch fields are
    /// used when both are set. Otherwise the `.patch` attachments are
    /// listed: a single one is used as is, several go through `selector`.
    pub fn plan(
        &self,
        issue: &str,
        version: &str,
        force_patches: bool,
        selector: &dyn PatchSelector,
    ) -> Result<FetchPlan> {
        let key = normalize_issue_key(issue);
        if !force_patches {
            let info = self.pull_info(&key)?;
            if let Some((url, reference)) = info.remote_for(version) {
                return Ok(FetchPlan {
                    issue: key,
                    version: version.to_string(),
                    source: FetchSource::Remote {
                        url: url.to_string(),
                        reference: reference.to_string(),
                    },
                });
            }
            log::info!(
                "No repository or branch set on {} for {}, looking for patches",
                key,
                version
            );
        }

        let mut candidates: Vec<Attachment> = self
            .issue(&key)?
            .attachments()
            .into_iter()
            .filter(Attachment::is_patch)
            .collect();
        candidates.sort_by(|a, b| a.filename.cmp(&b.filename));
        if candidates.is_empty() {
            return Err(Error::FetchPlanIncomplete {
                issue: key,
                message: "no repository and branch information, and no patch attached".to_string(),
            });
        }

        let patches = if candidates.len() == 1 && !force_patches {
            candidates
        } else {
            let indices = selector.select(&key, &candidates)?;
            let mut selected = Vec::with_capacity(indices.len());
            for index in indices {
                let patch = candidates.get(index).ok_or_else(|| Error::FetchPlanIncomplete {
                    issue: key.clone(),
                    message: format!("no patch at index {}", index),
                })?;
                selected.push(patch.clone());
            }
            selected
        };
        if patches.is_empty() {
            return Err(Error::FetchPlanIncomplete {
                issue: key,
                message: "no patch selected".to_string(),
            });
        }
        Ok(FetchPlan {
            issue: key,
            version: version.to_string(),
            source: FetchSource::Patches(patches),
        })
    }
}

/// How the fetched work is brought into the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Merge into the current branch.
    Pull,
    /// Fetch into `FETCH_HEAD` (or download the patches) and stop.
    FetchOnly,
    /// Hard reset a dedicated `-nomerge` branch to the fetched work.
    Checkout,
    /// Merge into the stable branch.
    Integration,
    /// Hard reset a new `-test`, `-test2`, ... branch to the fetched work.
    Testing,
}

impl FetchMode {
    pub const ALL: [FetchMode; 5] = [
        FetchMode::Pull,
        FetchMode::FetchOnly,
        FetchMode::Checkout,
        FetchMode::Integration,
        FetchMode::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Pull => "pull",
            FetchMode::FetchOnly => "fetch",
            FetchMode::Checkout => "checkout",
            FetchMode::Integration => "integration",
            FetchMode::Testing => "testing",
        }
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FetchMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::Config {
                message: format!(
                    "unknown fetch mode '{}', expected one of: pull, fetch, checkout, integration, testing",
                    s
                ),
            })
    }
}

/// Progress of one [`FetchExecutor`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchState {
    Idle,
    /// The stash step ran; something may or may not have been stashed.
    Stashed,
    Fetching,
    Merging,
    PatchApplying,
    HardResetting,
    Done,
    ConflictPending,
    Failed,
    Unstashed,
}

impl FetchState {
    pub fn can_advance_to(self, next: FetchState) -> bool {
        use FetchState::*;
        matches!(
            (self, next),
            (Idle, Stashed)
                | (Idle, Failed)
                | (Stashed, Fetching)
                | (Stashed, Failed)
                | (Fetching, Merging)
                | (Fetching, PatchApplying)
                | (Fetching, HardResetting)
                | (Fetching, Done)
                | (Fetching, Failed)
                | (Merging, Done)
                | (Merging, ConflictPending)
                | (Merging, Failed)
                | (PatchApplying, Done)
                | (PatchApplying, Failed)
                | (HardResetting, Done)
                | (HardResetting, Failed)
                | (Done, Unstashed)
                | (Done, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FetchState::ConflictPending | FetchState::Failed | FetchState::Unstashed
        )
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// The branch checked out at the end.
    pub branch: String,
    /// Whether stashed changes were popped back. `false` when nothing was stashed.
    pub stash_restored: bool,
    /// Patch files left on disk (fetch-only mode).
    pub downloaded: Vec<PathBuf>,
}

/// Executes one [`FetchPlan`] on an instance.
pub struct FetchExecutor<'a> {
    instance: &'a Instance,
    tracker: &'a dyn IssueTracker,
    state: FetchState,
    history: Vec<FetchState>,
    stashed: bool,
}

impl<'a> FetchExecutor<'a> {
    pub fn new(instance: &'a Instance, tracker: &'a dyn IssueTracker) -> Self {
        Self {
            instance,
            tracker,
            state: FetchState::Idle,
            history: vec![FetchState::Idle],
            stashed: false,
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Every state visited, starting with `Idle`.
    pub fn history(&self) -> &[FetchState] {
        &self.history
    }

    fn advance(&mut self, next: FetchState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::FetchFailed {
                message: format!("illegal transition from {:?} to {:?}", self.state, next),
                stash_pending: self.stashed,
            });
        }
        log::debug!("fetch: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn run(&mut self, plan: &FetchPlan, mode: FetchMode) -> Result<FetchOutcome> {
        if self.state != FetchState::Idle {
            return Err(Error::FetchFailed {
                message: "this fetch has already run".to_string(),
                stash_pending: self.stashed,
            });
        }

        // Download names are taken before stashing, so untracked files of the
        // user still count as taken.
        let destinations = match &plan.source {
            FetchSource::Patches(patches) => match download_paths(self.instance.path(), patches) {
                Ok(destinations) => destinations,
                Err(e) => {
                    self.advance(FetchState::Failed)?;
                    return Err(e);
                }
            },
            FetchSource::Remote { .. } => Vec::new(),
        };

        let git = self.instance.git();
        if mode == FetchMode::FetchOnly {
            log::debug!("Only fetching, the working tree is left alone");
            self.advance(FetchState::Stashed)?;
        } else {
            self.stash(git)?;
        }

        match self.execute(plan, mode, &destinations) {
            Ok((branch, downloaded)) => {
                self.advance(FetchState::Done)?;
                if let Err(e) = self.unstash() {
                    self.advance(FetchState::Failed)?;
                    return Err(Error::FetchFailed {
                        message: format!(
                            "could not pop the stash, your changes are still in it: {}",
                            e
                        ),
                        stash_pending: true,
                    });
                }
                self.advance(FetchState::Unstashed)?;
                Ok(FetchOutcome {
                    branch,
                    stash_restored: self.stashed,
                    downloaded,
                })
            }
            Err(Error::ConflictPending { reference, .. }) => {
                if self.stashed {
                    log::warn!("Your local changes were left in the stash");
                }
                Err(Error::ConflictPending {
                    reference,
                    stash_pending: self.stashed,
                })
            }
            Err(e) => {
                if self.state != FetchState::Failed {
                    self.advance(FetchState::Failed)?;
                }
                if self.stashed {
                    log::warn!("An error occurred, some files may have been left in your stash");
                }
                let message = match e {
                    Error::FetchFailed { message, .. } => message,
                    other => other.to_string(),
                };
                Err(Error::FetchFailed {
                    message,
                    stash_pending: self.stashed,
                })
            }
        }
    }

    fn stash(&mut self, git: &dyn GitOperations) -> Result<()> {
        match git.stash_save(true) {
            Ok(outcome) => {
                self.stashed = outcome == StashOutcome::Stashed;
                if self.stashed {
                    log::info!("Stashed your local changes");
                }
                self.advance(FetchState::Stashed)
            }
            Err(e) => {
                self.advance(FetchState::Failed)?;
                Err(Error::FetchFailed {
                    message: format!("could not stash your changes: {}", e),
                    stash_pending: false,
                })
            }
        }
    }

    fn unstash(&self) -> Result<()> {
        if !self.stashed {
            return Ok(());
        }
        match self.instance.git().stash_pop() {
            Ok(()) => {
                log::info!("Popped the stash");
                Ok(())
            }
            Err(e) => {
                log::error!("An error occurred while unstashing your changes: {}", e);
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        plan: &FetchPlan,
        mode: FetchMode,
        destinations: &[PathBuf],
    ) -> Result<(String, Vec<PathBuf>)> {
        self.advance(FetchState::Fetching)?;
        match &plan.source {
            FetchSource::Remote { url, reference } => self
                .execute_remote(plan, mode, url, reference)
                .map(|branch| (branch, Vec::new())),
            FetchSource::Patches(patches) => {
                self.execute_patches(plan, mode, patches, destinations)
            }
        }
    }

    fn execute_remote(
        &mut self,
        plan: &FetchPlan,
        mode: FetchMode,
        url: &str,
        reference: &str,
    ) -> Result<String> {
        let git = self.instance.git();
        log::info!("Fetching {} from {}", reference, url);
        git.fetch(url, Some(reference))?;

        match mode {
            FetchMode::FetchOnly => self.instance.current_branch(),
            FetchMode::Pull | FetchMode::Integration => {
                self.advance(FetchState::Merging)?;
                if mode == FetchMode::Integration {
                    self.switch_to(self.instance.stable_branch(), None)?;
                }
                let branch = self.instance.current_branch()?;
                log::info!("Merging into {}", branch);
                if !git.merge(FETCH_HEAD)? {
                    if git.conflicting_files()?.is_empty() {
                        return Err(Error::FetchFailed {
                            message: format!("could not merge {} from {}", reference, url),
                            stash_pending: self.stashed,
                        });
                    }
                    self.advance(FetchState::ConflictPending)?;
                    return Err(Error::ConflictPending {
                        reference: format!("{} from {}", reference, url),
                        stash_pending: self.stashed,
                    });
                }
                Ok(branch)
            }
            FetchMode::Checkout | FetchMode::Testing => {
                self.advance(FetchState::HardResetting)?;
                let branch = self.target_branch(plan, mode)?;
                let track = self.instance.upstream_stable_ref();
                self.switch_to(&branch, Some(&track))?;
                log::info!("Resetting {} to {}", branch, FETCH_HEAD);
                git.reset(FETCH_HEAD, true)?;
                Ok(branch)
            }
        }
    }

    fn execute_patches(
        &mut self,
        plan: &FetchPlan,
        mode: FetchMode,
        patches: &[Attachment],
        destinations: &[PathBuf],
    ) -> Result<(String, Vec<PathBuf>)> {
        let git = self.instance.git();
        let branch = match mode {
            FetchMode::Pull | FetchMode::FetchOnly => self.instance.current_branch()?,
            FetchMode::Integration => {
                let stable = self.instance.stable_branch().to_string();
                self.switch_to(&stable, None)?;
                stable
            }
            FetchMode::Checkout | FetchMode::Testing => {
                let branch = self.target_branch(plan, mode)?;
                let track = self.instance.upstream_stable_ref();
                self.switch_to(&branch, Some(&track))?;
                git.reset(&track, true)?;
                branch
            }
        };

        let files = self.download(patches, destinations)?;
        if mode == FetchMode::FetchOnly {
            return Ok((branch, files));
        }

        self.advance(FetchState::PatchApplying)?;
        match git.apply_patches(&files)? {
            PatchOutcome::Applied => {
                for file in &files {
                    if let Err(e) = fs::remove_file(file) {
                        log::warn!("Could not remove {}: {}", file.display(), e);
                    }
                }
                log::info!("Patches applied successfully");
                Ok((branch, Vec::new()))
            }
            PatchOutcome::CheckFailed => Err(Error::FetchFailed {
                message: "the patches do not apply, please apply them manually".to_string(),
                stash_pending: self.stashed,
            }),
            PatchOutcome::Failed => Err(Error::FetchFailed {
                message: "git am stopped while applying the patches, resolve or run 'git am --abort'"
                    .to_string(),
                stash_pending: self.stashed,
            }),
        }
    }

    /// Download every patch to its destination before applying any.
    fn download(&self, patches: &[Attachment], destinations: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::with_capacity(patches.len());
        for (patch, dest) in patches.iter().zip(destinations) {
            log::info!("Downloading patch as {}", dest.display());
            self.tracker
                .download(&patch.url, &dest)
                .map_err(|e| Error::FetchFailed {
                    message: format!(
                        "failed to download {} to {}: {}",
                        patch.filename,
                        dest.display(),
                        e
                    ),
                    stash_pending: self.stashed,
                })?;
            files.push(dest.clone());
        }
        Ok(files)
    }

    fn target_branch(&self, plan: &FetchPlan, mode: FetchMode) -> Result<String> {
        match mode {
            FetchMode::Testing => next_testing_branch(self.instance, &plan.issue, &plan.version),
            _ => Ok(self
                .instance
                .generate_branch_name(&plan.issue, Some(NO_MERGE_SUFFIX), Some(&plan.version))),
        }
    }

    fn switch_to(&self, branch: &str, track: Option<&str>) -> Result<()> {
        let git = self.instance.git();
        if !git.has_branch(branch, None)? {
            log::info!("Creating branch {}", branch);
            git.create_branch(branch, track)?;
        }
        log::info!("Switching to branch {}", branch);
        git.checkout(branch)
    }
}

/// Where each patch is downloaded inside `dir`.
///
/// Only the last component of an attachment name is kept; a name without
/// one (empty, `.` or `..`) is refused.
fn download_paths(dir: &Path, patches: &[Attachment]) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = Vec::with_capacity(patches.len());
    for patch in patches {
        let name = Path::new(&patch.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::FetchFailed {
                message: format!("refusing to download the attachment named '{}'", patch.filename),
                stash_pending: false,
            })?;
        let path = free_file_name(dir, name, &paths);
        paths.push(path);
    }
    Ok(paths)
}

/// The first of `name`, `name.1`, `name.2`, ... neither present in `dir` nor `taken`.
fn free_file_name(dir: &Path, name: &str, taken: &[PathBuf]) -> PathBuf {
    let mut candidate = dir.join(name);
    let mut index = 0;
    while candidate.exists() || taken.contains(&candidate) {
        index += 1;
        candidate = dir.join(format!("{}.{}", name, index));
    }
    candidate
}

/// The first free branch among `-test`, `-test2`, `-test3`, ...
pub fn next_testing_branch(instance: &Instance, issue: &str, version: &str) -> Result<String> {
    let git = instance.git();
    for attempt in 1..=MAX_BRANCH_SUFFIX_ATTEMPTS {
        let suffix = if attempt == 1 {
            TESTING_SUFFIX.to_string()
        } else {
            format!("{}{}", TESTING_SUFFIX, attempt)
        };
        let branch = instance.generate_branch_name(issue, Some(&suffix), Some(version));
        if !git.has_branch(&branch, None)? {
            return Ok(branch);
        }
    }
    Err(Error::FetchFailed {
        message: format!(
            "no free testing branch name after {} attempts",
            MAX_BRANCH_SUFFIX_ATTEMPTS
        ),
        stash_pending: false,
    })
}
