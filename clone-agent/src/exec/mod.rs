//! Child-process execution.
//!
//! Every side effect on the host (package installs, service control, dumps,
//! ownership fixes) goes through a [`CommandRunner`]. Production code uses
//! [`SystemRunner`]; tests substitute a recording fake.

pub mod context;
pub mod layout;

#[cfg(test)]
pub(crate) mod fake;

pub use context::{Capability, ExecContext};
pub use layout::SystemLayout;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::utils::errors::{CloneError, Result};

/// A single command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Run through `sudo -u <user> -H`
    pub as_user: Option<String>,
    /// Feed this file to stdin
    pub stdin_file: Option<PathBuf>,
    /// Redirect stdout into this file instead of capturing it
    pub stdout_file: Option<PathBuf>,
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

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.as_user = Some(user.into());
        self
    }

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Full argv, including the `sudo` prefix for run-as-user commands.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(user) = &self.as_user {
            argv.extend(["sudo", "-u", user.as_str(), "-H", "--"].map(String::from));
            if !self.env.is_empty() {
                argv.push("env".to_string());
                argv.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Shell-like rendering used in logs and reports.
    pub fn display(&self) -> String {
        let mut line = self.argv().join(" ");
        if let Some(path) = &self.stdin_file {
            line.push_str(&format!(" < {}", path.display()));
        }
        if let Some(path) = &self.stdout_file {
            line.push_str(&format!(" > {}", path.display()));
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Non-empty, trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Host command execution seam.
pub trait CommandRunner {
    /// Run a command to completion. A non-zero exit is reported through
    /// `CommandOutput::success`, not as an `Err`.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    fn user_exists(&self, name: &str) -> bool {
        self.run(&CommandSpec::new("id").args(["-u", name]))
            .map(|o| o.success)
            .unwrap_or(false)
    }

    fn has_binary(&self, name: &str) -> bool {
        self.run(&CommandSpec::new("sh").args(["-c", &format!("command -v {}", name)]))
            .map(|o| o.success)
            .unwrap_or(false)
    }
}

/// Runs commands on the local host with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let argv = spec.argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if spec.as_user.is_none() {
            cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        match &spec.stdin_file {
            Some(path) => cmd.stdin(Stdio::from(File::open(path)?)),
            None => cmd.stdin(Stdio::null()),
        };
        if let Some(path) = &spec.stdout_file {
            cmd.stdout(Stdio::from(File::create(path)?));
        }

        debug!("exec: {}", spec.display());
        let output = cmd.output().map_err(|source| CloneError::CommandSpawn {
            command: spec.display(),
            source,
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn user_exists(&self, name: &str) -> bool {
        matches!(nix::unistd::User::from_name(name), Ok(Some(_)))
    }
}
