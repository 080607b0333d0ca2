//! External process execution.
//!
//! Every tool mdk drives (php, database clients, helper scripts) goes through
//! a [`Runner`], so the same command can run on the host or inside a container.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// A command to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Stream output to the terminal instead of capturing it.
    pub inherit_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.inherit_output = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `-1` when the process was terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes commands on behalf of an instance.
pub trait Runner {
    fn exec(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// The instance's code directory as seen by executed commands, when it
    /// differs from the host path.
    fn workdir(&self) -> Option<&Path> {
        None
    }

    /// The data directory as seen by executed commands, when it differs from
    /// the host path.
    fn dataroot(&self) -> Option<&Path> {
        None
    }
}

/// Runs commands directly on the host.
#[derive(Debug, Clone, Default)]
pub struct HostRunner {
    /// Program substitutions, e.g. `php` to `/usr/bin/php8.2`.
    binaries: BTreeMap<String, String>,
}

impl HostRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.binaries.insert(name.into(), path.into());
        self
    }
}

impl Runner for HostRunner {
    fn exec(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let program = self
            .binaries
            .get(&spec.program)
            .cloned()
            .unwrap_or_else(|| spec.program.clone());
        log::debug!("{}", spec);

        let mut command = Command::new(&program);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let spawn_error = |e: std::io::Error| Error::Process {
            command: spec.to_string(),
            message: e.to_string(),
        };

        if spec.inherit_output {
            let status = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(spawn_error)?;
            return Ok(CommandOutput {
                code: status.code().unwrap_or(-1),
                ..Default::default()
            });
        }

        let output = command.stdin(Stdio::null()).output().map_err(spawn_error)?;
        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() && !result.stderr.is_empty() {
            log::debug!("exit {}: {}", result.code, result.stderr.trim_end());
        }
        Ok(result)
    }
}

/// Runs commands inside a Docker container through `docker exec`.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    container: String,
    workdir: PathBuf,
    dataroot: PathBuf,
    host: HostRunner,
}

impl DockerRunner {
    pub const DEFAULT_WORKDIR: &'static str = "/var/www/html";
    pub const DEFAULT_DATAROOT: &'static str = "/var/www/moodledata";

    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            workdir: PathBuf::from(Self::DEFAULT_WORKDIR),
            dataroot: PathBuf::from(Self::DEFAULT_DATAROOT),
            host: HostRunner::new(),
        }
    }

    /// The host-side command that executes `spec` in the container.
    pub fn wrap(&self, spec: &CommandSpec) -> CommandSpec {
        let mut wrapped = CommandSpec::new("docker")
            .arg("exec")
            .arg("-w")
            .arg(self.workdir.to_string_lossy())
            .arg("-u")
            .arg("0:0");
        for (key, value) in &spec.env {
            wrapped = wrapped.arg("-e").arg(format!("{}={}", key, value));
        }
        if spec.inherit_output {
            wrapped = wrapped.arg("-it").inherit_output();
        }
        wrapped = wrapped
            .arg(&self.container)
            .arg(&spec.program)
            .args(spec.args.iter().cloned());
        wrapped.cwd = spec.cwd.clone();
        wrapped
    }
}

impl Runner for DockerRunner {
    fn exec(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.host.exec(&self.wrap(spec))
    }

    fn workdir(&self) -> Option<&Path> {
        Some(&self.workdir)
    }

    fn dataroot(&self) -> Option<&Path> {
        Some(&self.dataroot)
    }
}
