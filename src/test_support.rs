//! Shared test doubles.
//!
//! The doubles share their state through `Arc<Mutex<...>>`, so a test keeps a
//! clone to inspect calls after handing the double to the code under test.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::database::DatabaseServer;
use crate::error::{Error, Result};
use crate::git::{CherryPick, GitOperations, PatchOutcome, StashOutcome};
use crate::process::{CommandOutput, CommandSpec, Runner};

/// In-memory model of a working copy.
#[derive(Debug, Default)]
pub struct GitState {
    pub current: String,
    pub branches: BTreeSet<String>,
    /// Remote-tracking branches as `remote/branch`.
    pub remote_branches: BTreeSet<String>,
    pub remotes: BTreeMap<String, String>,
    /// Uncommitted changes; `None` is a clean tree.
    pub changes: Option<String>,
    pub stash: Vec<String>,
    /// Operation names that fail: `fetch`, `merge`, `reset`, `checkout`,
    /// `stash`, `stash_pop`, `cherry_pick`, `cherry_pick_continue`, `rebase`, `push`.
    pub failing: BTreeSet<String>,
    pub conflicts: Vec<String>,
    pub hashes: Vec<String>,
    pub messages: Vec<String>,
    pub patch_outcome: Option<PatchOutcome>,
    pub applied: Vec<PathBuf>,
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MockGit {
    state: Arc<Mutex<GitState>>,
}

impl MockGit {
    /// A repository on `branch`, which exists locally and on the `stable` remote.
    pub fn on_branch(branch: &str) -> Self {
        let git = Self::default();
        {
            let mut state = git.state();
            state.current = branch.to_string();
            state.branches.insert(branch.to_string());
            state.remote_branches.insert(format!("stable/{}", branch));
            state
                .remotes
                .insert("stable".to_string(), "https://git.example/moodle.git".to_string());
        }
        git
    }

    pub fn state(&self) -> MutexGuard<'_, GitState> {
        self.state.lock().unwrap()
    }

    pub fn with_branch(self, branch: &str) -> Self {
        self.state().branches.insert(branch.to_string());
        self
    }

    pub fn with_changes(self, changes: &str) -> Self {
        self.state().changes = Some(changes.to_string());
        self
    }

    pub fn with_remote(self, name: &str, url: &str) -> Self {
        self.state()
            .remotes
            .insert(name.to_string(), url.to_string());
        self
    }

    pub fn failing(self, operation: &str) -> Self {
        self.state().failing.insert(operation.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) -> MutexGuard<'_, GitState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

fn git_error(command: &str, stderr: &str) -> Error {
    Error::GitCommand {
        command: format!("git {}", command),
        stderr: stderr.to_string(),
    }
}

fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl GitOperations for MockGit {
    fn current_branch(&self) -> Result<String> {
        let state = self.state();
        if state.current.is_empty() {
            Ok("HEAD".to_string())
        } else {
            Ok(state.current.clone())
        }
    }

    fn has_branch(&self, name: &str, remote: Option<&str>) -> Result<bool> {
        let state = self.state();
        Ok(match remote {
            Some(remote) => state
                .remote_branches
                .contains(&format!("{}/{}", remote, name)),
            None => state.branches.contains(name),
        })
    }

    fn create_branch(&self, name: &str, track: Option<&str>) -> Result<()> {
        let mut state = self.record(format!(
            "create_branch {} {}",
            name,
            track.unwrap_or("")
        ));
        if !state.branches.insert(name.to_string()) {
            return Err(git_error("branch", "branch already exists"));
        }
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.record(format!("checkout {}", branch));
        if state.failing.contains("checkout") || !state.branches.contains(branch) {
            return Err(git_error(&format!("checkout {}", branch), "pathspec did not match"));
        }
        state.current = branch.to_string();
        Ok(())
    }

    fn fetch(&self, remote: &str, reference: Option<&str>) -> Result<()> {
        let state = self.record(format!("fetch {} {}", remote, reference.unwrap_or("")));
        if state.failing.contains("fetch") {
            return Err(git_error("fetch", "could not read from remote"));
        }
        Ok(())
    }

    fn merge(&self, reference: &str) -> Result<bool> {
        let state = self.record(format!("merge {}", reference));
        Ok(!state.failing.contains("merge"))
    }

    fn pull(&self, remote: &str, reference: Option<&str>) -> Result<CommandOutput> {
        let state = self.record(format!("pull {} {}", remote, reference.unwrap_or("")));
        Ok(if state.failing.contains("pull") {
            exit(1, "pull failed")
        } else {
            exit(0, "")
        })
    }

    fn push(&self, remote: &str, branch: &str, force: bool) -> Result<CommandOutput> {
        let state = self.record(format!("push {} {} {}", remote, branch, force));
        Ok(if state.failing.contains("push") {
            exit(1, "rejected")
        } else {
            exit(0, "")
        })
    }

    fn stash_save(&self, untracked: bool) -> Result<StashOutcome> {
        let mut state = self.record(format!("stash_save {}", untracked));
        if state.failing.contains("stash") {
            return Err(git_error("stash", "cannot stash"));
        }
        match state.changes.take() {
            Some(changes) => {
                state.stash.push(changes);
                Ok(StashOutcome::Stashed)
            }
            None => Ok(StashOutcome::NoLocalChanges),
        }
    }

    fn stash_pop(&self) -> Result<()> {
        let mut state = self.record("stash_pop".to_string());
        if state.failing.contains("stash_pop") {
            return Err(git_error("stash pop", "conflict"));
        }
        match state.stash.pop() {
            Some(changes) => {
                state.changes = Some(changes);
                Ok(())
            }
            None => Err(git_error("stash pop", "No stash entries found.")),
        }
    }

    fn reset(&self, to: &str, hard: bool) -> Result<()> {
        let state = self.record(format!("reset {} {}", to, hard));
        if state.failing.contains("reset") {
            return Err(git_error("reset", "bad revision"));
        }
        Ok(())
    }

    fn cherry_pick(&self, op: CherryPick<'_>) -> Result<CommandOutput> {
        let (call, failing) = match op {
            CherryPick::Commits(hashes) => {
                (format!("cherry_pick {}", hashes.join(" ")), "cherry_pick")
            }
            CherryPick::Continue => ("cherry_pick --continue".to_string(), "cherry_pick_continue"),
            CherryPick::Abort => ("cherry_pick --abort".to_string(), "cherry_pick_abort"),
        };
        let state = self.record(call);
        Ok(if state.failing.contains(failing) {
            exit(1, "conflict")
        } else {
            exit(0, "")
        })
    }

    fn rebase(&self, base: &str, branch: &str) -> Result<CommandOutput> {
        let mut state = self.record(format!("rebase {} {}", base, branch));
        state.current = branch.to_string();
        Ok(if state.failing.contains("rebase") {
            exit(1, "")
        } else {
            exit(0, "")
        })
    }

    fn rebase_abort(&self) -> Result<()> {
        drop(self.record("rebase --abort".to_string()));
        Ok(())
    }

    fn apply_patches(&self, files: &[PathBuf]) -> Result<PatchOutcome> {
        let mut state = self.record(format!("apply_patches {}", files.len()));
        let outcome = state.patch_outcome.unwrap_or(PatchOutcome::Applied);
        if outcome == PatchOutcome::Applied {
            state.applied.extend(files.iter().cloned());
        }
        Ok(outcome)
    }

    fn conflicting_files(&self) -> Result<Vec<String>> {
        Ok(self.state().conflicts.clone())
    }

    fn add(&self, path: &str) -> Result<()> {
        drop(self.record(format!("add {}", path)));
        Ok(())
    }

    fn commit_with_message_file(&self, file: &Path) -> Result<()> {
        drop(self.record(format!("commit -F {}", file.display())));
        Ok(())
    }

    fn hashes(&self, range: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let state = self.record(format!("hashes {}", range));
        let hashes = state.hashes.clone();
        Ok(match limit {
            Some(limit) => hashes.into_iter().take(limit).collect(),
            None => hashes,
        })
    }

    fn messages(&self, _range: Option<&str>, count: usize) -> Result<Vec<String>> {
        Ok(self.state().messages.iter().take(count).cloned().collect())
    }

    fn get_config(&self, name: &str) -> Result<Option<String>> {
        let state = self.state();
        Ok(name
            .strip_prefix("remote.")
            .and_then(|rest| rest.strip_suffix(".url"))
            .and_then(|remote| state.remotes.get(remote).cloned()))
    }

    fn remotes(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.state().remotes.clone())
    }

    fn set_remote(&self, name: &str, url: &str) -> Result<()> {
        let mut state = self.record(format!("set_remote {} {}", name, url));
        state.remotes.insert(name.to_string(), url.to_string());
        Ok(())
    }

    fn remove_remote(&self, name: &str) -> Result<()> {
        let mut state = self.record(format!("remove_remote {}", name));
        state.remotes.remove(name);
        Ok(())
    }

    fn create_patch(&self, range: &str, dest: &Path) -> Result<()> {
        drop(self.record(format!("create_patch {}", range)));
        fs::write(dest, format!("patch for {}\n", range))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    calls: Vec<CommandSpec>,
    failing: Vec<String>,
    stdout: Vec<(String, String)>,
    files: Vec<(String, PathBuf, String)>,
}

/// A [`Runner`] that records commands instead of executing them.
///
/// Behaviour is keyed on substrings of the rendered command line.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with code 1.
    pub fn failing(self, pattern: &str) -> Self {
        self.state.lock().unwrap().failing.push(pattern.to_string());
        self
    }

    /// Commands containing `pattern` print `stdout`.
    pub fn with_stdout(self, pattern: &str, stdout: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .stdout
            .push((pattern.to_string(), stdout.to_string()));
        self
    }

    /// Commands containing `pattern` write `content` to `path`, like an installer would.
    pub fn writing(self, pattern: &str, path: &Path, content: &str) -> Self {
        self.state.lock().unwrap().files.push((
            pattern.to_string(),
            path.to_path_buf(),
            content.to_string(),
        ));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.to_string()).collect()
    }
}

impl Runner for MockRunner {
    fn exec(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let line = spec.to_string();
        state.calls.push(spec.clone());

        for (pattern, path, content) in &state.files {
            if line.contains(pattern.as_str()) {
                fs::write(path, content)?;
            }
        }
        let code = if state.failing.iter().any(|p| line.contains(p.as_str())) {
            1
        } else {
            0
        };
        let stdout = state
            .stdout
            .iter()
            .find(|(p, _)| line.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            code,
            stdout,
            stderr: if code == 0 { String::new() } else { "failed".to_string() },
        })
    }
}

/// A database server holding its databases in memory.
#[derive(Debug, Clone, Default)]
pub struct MockDatabase {
    pub databases: Arc<Mutex<BTreeSet<String>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockDatabase {
    pub fn with_database(self, name: &str) -> Self {
        self.databases.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.databases.lock().unwrap().contains(name)
    }
}

impl DatabaseServer for MockDatabase {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.has(name))
    }

    fn create(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("create {}", name));
        self.databases.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("drop {}", name));
        self.databases.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Write a `version.php` the way the product ships it.
pub fn write_version_file(code_dir: &Path, branch: &str) {
    fs::create_dir_all(code_dir).unwrap();
    let content = format!(
        "<?php\n\
         // MOODLE VERSION INFORMATION\n\
         \n\
         defined('MOODLE_INTERNAL') || die();\n\
         \n\
         $version  = 2024100700.00;\n\
         $release  = '4.5 (Build: 20241007)';\n\
         $branch   = '{}';\n\
         $maturity = MATURITY_STABLE;\n",
        branch
    );
    fs::write(code_dir.join("version.php"), content).unwrap();
}

/// A `config.php` as written by the product's installer.
pub fn installed_site_config(dbname: &str, dataroot: &Path) -> String {
    format!(
        "<?php  // Moodle configuration file\n\
         \n\
         unset($CFG);\n\
         global $CFG;\n\
         $CFG = new stdClass();\n\
         \n\
         $CFG->dbtype    = 'pgsql';\n\
         $CFG->dblibrary = 'native';\n\
         $CFG->dbhost    = 'localhost';\n\
         $CFG->dbname    = '{}';\n\
         $CFG->prefix    = 'mdl_';\n\
         $CFG->wwwroot   = 'http://localhost/stable_main';\n\
         $CFG->dataroot  = '{}';\n\
         $CFG->directorypermissions = 0777;\n\
         \n\
         require_once(__DIR__ . '/lib/setup.php');\n\
         \n\
         // There is no php closing tag in this file,\n\
         // it is intentional because it prevents trailing whitespace problems!\n",
        dbname,
        dataroot.display()
    )
}

/// Lay out an instance directory (`<base>/<name>/{moodle,moodledata,extra}`).
pub fn create_instance_dirs(base: &Path, name: &str, branch: &str) -> PathBuf {
    let root = base.join(name);
    write_version_file(&root.join("moodle"), branch);
    fs::create_dir_all(root.join("moodledata")).unwrap();
    fs::create_dir_all(root.join("extra")).unwrap();
    root
}
