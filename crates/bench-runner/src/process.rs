use crate::error::{CollectError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{Command, Stdio};
use tracing::debug;

/// A program plus its arguments, never passed through a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    /// Splits a rendered command line on whitespace.
    pub fn from_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| CollectError::config("empty command line"))?;
        Ok(Self::new(program).args(parts))
    }

    /// Returns a copy with `prefix` placed in front of this command.
    pub fn prefixed(&self, prefix: &[String]) -> Self {
        match prefix.split_first() {
            None => self.clone(),
            Some((program, rest)) => CommandSpec::new(program.clone())
                .args(rest.iter().cloned())
                .arg(self.program.clone())
                .args(self.args.iter().cloned()),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        out.push(self.program.clone());
        out.extend(self.args.iter().cloned());
        out
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_vec().join(" "))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Synchronous process execution. A non-zero exit is an error carrying the
/// captured output.
pub trait CommandRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Launches a background process and returns without waiting on it.
    fn spawn_detached(&self, cmd: &CommandSpec) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %cmd, "running command");
        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CollectError::Spawn {
                command: cmd.to_string(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(CollectError::Command {
                command: cmd.to_string(),
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }

    fn spawn_detached(&self, cmd: &CommandSpec) -> Result<()> {
        debug!(command = %cmd, "spawning background command");
        Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CollectError::Spawn {
                command: cmd.to_string(),
                source,
            })?;
        Ok(())
    }
}

/// Privilege escalation for commands that touch docker, cgroups, or the
/// monitoring daemons.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Privilege {
    pub sudo: bool,
    /// Variables re-exported through sudo so the workload sees the caller's
    /// toolchain (sudo resets the environment).
    pub preserve_env: Vec<String>,
}

impl Default for Privilege {
    fn default() -> Self {
        Self {
            sudo: true,
            preserve_env: vec!["LD_LIBRARY_PATH".to_string(), "PATH".to_string()],
        }
    }
}

impl Privilege {
    pub fn none() -> Self {
        Self {
            sudo: false,
            preserve_env: Vec::new(),
        }
    }

    /// `sudo cmd ...`
    pub fn wrap(&self, cmd: &CommandSpec) -> CommandSpec {
        if self.sudo {
            cmd.prefixed(&["sudo".to_string()])
        } else {
            cmd.clone()
        }
    }

    /// `sudo VAR=value ... cmd ...`, reading values from the current process.
    pub fn wrap_with_env(&self, cmd: &CommandSpec) -> CommandSpec {
        if !self.sudo {
            return cmd.clone();
        }
        let mut prefix = vec!["sudo".to_string()];
        for var in &self.preserve_env {
            if let Ok(value) = std::env::var(var) {
                prefix.push(format!("{}={}", var, value));
            }
        }
        cmd.prefixed(&prefix)
    }
}
