//! Version-control operations on an instance's working copy.
//!
//! This uses the system git command, so SSH keys, credential helpers and
//! anything configured in `~/.gitconfig` apply transparently.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::process::CommandOutput;

/// Result of attempting to stash local changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashOutcome {
    Stashed,
    /// There was nothing to stash, so nothing must be popped later.
    NoLocalChanges,
}

/// Result of applying a series of patch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    /// `git apply --check` refused the patches; the tree is untouched.
    CheckFailed,
    /// `git am` stopped part way, usually on conflicts.
    Failed,
}

/// Arguments of a cherry-pick invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CherryPick<'a> {
    Commits(&'a [String]),
    Continue,
    Abort,
}

/// The git operations mdk performs on a working copy.
///
/// Operations whose exit status is the interesting answer (pull, push,
/// cherry-pick, rebase) return the raw [`CommandOutput`]. Operations whose
/// failure is exceptional return [`Error::GitCommand`].
pub trait GitOperations {
    /// The checked-out branch, or `"HEAD"` when detached.
    fn current_branch(&self) -> Result<String>;
    fn has_branch(&self, name: &str, remote: Option<&str>) -> Result<bool>;
    fn create_branch(&self, name: &str, track: Option<&str>) -> Result<()>;
    fn checkout(&self, branch: &str) -> Result<()>;
    fn fetch(&self, remote: &str, reference: Option<&str>) -> Result<()>;
    /// Merge `reference` into the current branch. `false` when it stopped on conflicts.
    fn merge(&self, reference: &str) -> Result<bool>;
    fn pull(&self, remote: &str, reference: Option<&str>) -> Result<CommandOutput>;
    fn push(&self, remote: &str, branch: &str, force: bool) -> Result<CommandOutput>;
    fn stash_save(&self, untracked: bool) -> Result<StashOutcome>;
    fn stash_pop(&self) -> Result<()>;
    fn reset(&self, to: &str, hard: bool) -> Result<()>;
    fn cherry_pick(&self, op: CherryPick<'_>) -> Result<CommandOutput>;
    /// Rebase `branch` onto `base`. Git checks out `branch` first.
    fn rebase(&self, base: &str, branch: &str) -> Result<CommandOutput>;
    fn rebase_abort(&self) -> Result<()>;
    fn apply_patches(&self, files: &[PathBuf]) -> Result<PatchOutcome>;
    fn conflicting_files(&self) -> Result<Vec<String>>;
    fn add(&self, path: &str) -> Result<()>;
    fn commit_with_message_file(&self, file: &Path) -> Result<()>;
    /// Commit hashes of `range`, newest first.
    fn hashes(&self, range: &str, limit: Option<usize>) -> Result<Vec<String>>;
    /// Commit subjects, newest first.
    fn messages(&self, range: Option<&str>, count: usize) -> Result<Vec<String>>;
    fn get_config(&self, name: &str) -> Result<Option<String>>;
    /// Remote names mapped to their fetch URL.
    fn remotes(&self) -> Result<BTreeMap<String, String>>;
    fn set_remote(&self, name: &str, url: &str) -> Result<()>;
    fn remove_remote(&self, name: &str) -> Result<()>;
    /// Write `git format-patch --stdout <range>` to `dest`.
    fn create_patch(&self, range: &str, dest: &Path) -> Result<()>;

    fn get_remote(&self, name: &str) -> Result<Option<String>> {
        Ok(self.remotes()?.remove(name))
    }
}

/// A working copy driven through the `git` binary.
#[derive(Debug, Clone)]
pub struct Git {
    path: PathBuf,
    bin: String,
}

impl Git {
    pub fn new(path: impl Into<PathBuf>, bin: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bin: bin.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn execute<I, S>(&self, args: I) -> Result<(String, CommandOutput)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let command = format!("{} {}", self.bin, args.join(" "));
        log::debug!("{}", command);

        let output = Command::new(&self.bin)
            .args(&args)
            .current_dir(&self.path)
            .output()
            .map_err(|e| Error::GitCommand {
                command: command.clone(),
                stderr: e.to_string(),
            })?;

        Ok((
            command,
            CommandOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
        ))
    }

    /// Run a command that is expected to succeed, returning its stdout.
    fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (command, output) = self.execute(args)?;
        if !output.success() {
            return Err(Error::GitCommand {
                command,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn status<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.execute(args)?.1)
    }
}

impl GitOperations for Git {
    fn current_branch(&self) -> Result<String> {
        let output = self.status(["symbolic-ref", "-q", "HEAD"])?;
        if !output.success() {
            return Ok("HEAD".to_string());
        }
        Ok(output
            .stdout
            .trim()
            .trim_start_matches("refs/heads/")
            .to_string())
    }

    fn has_branch(&self, name: &str, remote: Option<&str>) -> Result<bool> {
        let reference = match remote {
            Some(remote) if !remote.is_empty() => format!("refs/remotes/{}/{}", remote, name),
            _ => format!("refs/heads/{}", name),
        };
        Ok(self
            .status(["show-ref", "--verify", "--quiet", reference.as_str()])?
            .success())
    }

    fn create_branch(&self, name: &str, track: Option<&str>) -> Result<()> {
        match track {
            Some(track) => self.run(["branch", "--track", name, track])?,
            None => self.run(["branch", name])?,
        };
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        if self.current_branch()? == branch {
            return Ok(());
        }
        self.run(["checkout", branch])?;
        Ok(())
    }

    fn fetch(&self, remote: &str, reference: Option<&str>) -> Result<()> {
        let mut args = vec!["fetch", remote];
        args.extend(reference);
        self.run(args)?;
        Ok(())
    }

    fn merge(&self, reference: &str) -> Result<bool> {
        Ok(self.status(["merge", reference])?.success())
    }

    fn pull(&self, remote: &str, reference: Option<&str>) -> Result<CommandOutput> {
        let mut args = vec!["pull", remote];
        args.extend(reference);
        self.status(args)
    }

    fn push(&self, remote: &str, branch: &str, force: bool) -> Result<CommandOutput> {
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        args.extend([remote, branch]);
        self.status(args)
    }

    fn stash_save(&self, untracked: bool) -> Result<StashOutcome> {
        let mut args = vec!["stash", "push"];
        if untracked {
            args.push("--include-untracked");
        }
        let stdout = self.run(args)?;
        Ok(parse_stash_output(&stdout))
    }

    fn stash_pop(&self) -> Result<()> {
        self.run(["stash", "pop"])?;
        Ok(())
    }

    fn reset(&self, to: &str, hard: bool) -> Result<()> {
        if hard {
            self.run(["reset", "--hard", to])?;
        } else {
            self.run(["reset", to])?;
        }
        Ok(())
    }

    fn cherry_pick(&self, op: CherryPick<'_>) -> Result<CommandOutput> {
        let mut args = vec!["cherry-pick".to_string()];
        match op {
            CherryPick::Commits(hashes) => args.extend(hashes.iter().cloned()),
            CherryPick::Continue => args.push("--continue".to_string()),
            CherryPick::Abort => args.push("--abort".to_string()),
        }
        self.status(args)
    }

    fn rebase(&self, base: &str, branch: &str) -> Result<CommandOutput> {
        self.status(["rebase", base, branch])
    }

    fn rebase_abort(&self) -> Result<()> {
        self.run(["rebase", "--abort"])?;
        Ok(())
    }

    fn apply_patches(&self, files: &[PathBuf]) -> Result<PatchOutcome> {
        let files: Vec<String> = files
            .iter()
            .map(|f| f.to_string_lossy().into_owned())
            .collect();

        let mut check = vec!["apply".to_string(), "--check".to_string()];
        check.extend(files.iter().cloned());
        if !self.status(check)?.success() {
            return Ok(PatchOutcome::CheckFailed);
        }

        let mut am = vec!["am".to_string()];
        am.extend(files);
        if self.status(am)?.success() {
            Ok(PatchOutcome::Applied)
        } else {
            Ok(PatchOutcome::Failed)
        }
    }

    fn conflicting_files(&self) -> Result<Vec<String>> {
        let stdout = self.run(["diff", "--name-only", "--diff-filter=U"])?;
        Ok(non_empty_lines(&stdout))
    }

    fn add(&self, path: &str) -> Result<()> {
        self.run(["add", path])?;
        Ok(())
    }

    fn commit_with_message_file(&self, file: &Path) -> Result<()> {
        let file = file.to_string_lossy();
        self.run(["commit", "-F", file.as_ref()])?;
        Ok(())
    }

    fn hashes(&self, range: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let mut args = vec!["log".to_string(), "--format=%H".to_string()];
        if let Some(limit) = limit {
            args.push("-n".to_string());
            args.push(limit.to_string());
        }
        args.push(range.to_string());
        Ok(non_empty_lines(&self.run(args)?))
    }

    fn messages(&self, range: Option<&str>, count: usize) -> Result<Vec<String>> {
        let count = count.to_string();
        let mut args = vec!["log", "--format=%s", "-n", count.as_str()];
        args.extend(range);
        Ok(non_empty_lines(&self.run(args)?))
    }

    fn get_config(&self, name: &str) -> Result<Option<String>> {
        let output = self.status(["config", "--get", name])?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    fn remotes(&self) -> Result<BTreeMap<String, String>> {
        Ok(parse_remotes(&self.run(["remote", "-v"])?))
    }

    fn set_remote(&self, name: &str, url: &str) -> Result<()> {
        if self.get_remote(name)?.is_some() {
            self.run(["remote", "set-url", name, url])?;
        } else {
            self.run(["remote", "add", name, url])?;
        }
        Ok(())
    }

    fn remove_remote(&self, name: &str) -> Result<()> {
        self.run(["remote", "remove", name])?;
        Ok(())
    }

    fn create_patch(&self, range: &str, dest: &Path) -> Result<()> {
        let patch = self.run(["format-patch", "--stdout", range])?;
        fs::write(dest, patch)?;
        Ok(())
    }
}

/// `git stash` succeeds with this message when the tree is clean.
fn parse_stash_output(stdout: &str) -> StashOutcome {
    if stdout.trim_start().starts_with("No local changes") {
        StashOutcome::NoLocalChanges
    } else {
        StashOutcome::Stashed
    }
}

/// Parse `git remote -v`, keeping the fetch URL of each remote.
fn parse_remotes(output: &str) -> BTreeMap<String, String> {
    let mut remotes = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(url)) = (parts.next(), parts.next()) else {
            continue;
        };
        let kind = parts.next().unwrap_or("(fetch)");
        if kind == "(fetch)" || !remotes.contains_key(name) {
            remotes.insert(name.to_string(), url.to_string());
        }
    }
    remotes
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn run_detached(bin: &str, args: &[&str], cwd: Option<&Path>) -> Result<()> {
    let command = format!("{} {}", bin, args.join(" "));
    log::debug!("{}", command);
    let mut cmd = Command::new(bin);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd.output().map_err(|e| Error::GitCommand {
        command: command.clone(),
        stderr: e.to_string(),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = if stderr.contains("Authentication failed")
            || stderr.contains("Could not read from remote repository")
        {
            format!(
                "{}\n  hint: make sure your SSH key or credential helper gives access to the repository",
                stderr.trim()
            )
        } else {
            stderr.trim().to_string()
        };
        return Err(Error::GitCommand { command, stderr });
    }
    Ok(())
}

/// Create a bare mirror of `url` at `dest`, used as a local clone cache.
pub fn clone_mirror(bin: &str, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let dest = dest.to_string_lossy();
    run_detached(bin, &["clone", "--mirror", url, dest.as_ref()], None)
}

/// Clone `source` (a URL or a local mirror) into `dest`.
pub fn clone(bin: &str, source: &str, dest: &Path) -> Result<()> {
    let dest = dest.to_string_lossy();
    run_detached(bin, &["clone", source, dest.as_ref()], None)
}

/// Refresh a mirror created by [`clone_mirror`].
pub fn fetch_mirror(bin: &str, path: &Path) -> Result<()> {
    run_detached(bin, &["fetch", "--all", "--prune"], Some(path))
}
