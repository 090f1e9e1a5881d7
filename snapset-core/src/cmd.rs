//! Running local commands.
//!
//! Vendor CLIs, `ssh` to the NAS console and the LVM tools are all driven
//! through [`CommandRunner`] so tests can substitute canned output.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapset_common::mask_secrets;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// A program invocation. `Display` renders it for logs with secrets masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
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
        self.env.insert(key.into(), value.into());
        self
    }

    /// The command as a single POSIX shell string, arguments quoted as needed.
    pub fn to_shell(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask_secrets(&self.to_shell()))
    }
}

/// Quote `word` for a POSIX shell when it contains anything but safe characters.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdOutput {
    pub status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout and stderr together, for vendor CLIs that report errors on either.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {}: {}", .output.status, .output.combined().trim())]
    Failed { command: String, output: CmdOutput },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

impl CmdError {
    /// The captured output, when the process ran to completion.
    pub fn output(&self) -> Option<&CmdOutput> {
        match self {
            Self::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Runs commands and collects their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` and collect all output regardless of exit status.
    async fn output(&self, cmd: &CommandLine) -> Result<CmdOutput, CmdError>;

    /// Run `cmd`; a non-zero exit status becomes [`CmdError::Failed`].
    async fn output_success(&self, cmd: &CommandLine) -> Result<CmdOutput, CmdError> {
        let out = self.output(cmd).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(CmdError::Failed {
                command: cmd.to_string(),
                output: out,
            })
        }
    }
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Kill the child and fail with [`CmdError::Timeout`] after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, cmd: &CommandLine) -> Result<CmdOutput, CmdError> {
        debug!(command = %cmd, "Running command");

        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| CmdError::Timeout {
                    command: cmd.to_string(),
                    secs: limit.as_secs(),
                })?,
            None => child.await,
        }
        .map_err(|source| CmdError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        Ok(CmdOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_rendering_quotes_and_masks() {
        let cmd = CommandLine::new("naviseccli")
            .args(["-h", "10.0.0.1", "-user", "admin", "-password", "p@ss word"])
            .args(["snap", "-create", "-descr", "Snapset Snapshot"]);

        assert_eq!(
            cmd.to_shell(),
            "naviseccli -h 10.0.0.1 -user admin -password 'p@ss word' snap -create -descr 'Snapset Snapshot'"
        );
        assert_eq!(
            cmd.to_string(),
            "naviseccli -h 10.0.0.1 -user admin -password ******** snap -create -descr 'Snapset Snapshot'"
        );
    }

    #[test]
    fn test_quote_embedded_single_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_system_runner_captures_status() {
        let runner = SystemRunner::new();
        let out = runner
            .output(&CommandLine::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");

        let err = runner
            .output_success(&CommandLine::new("sh").args(["-c", "exit 1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new().with_timeout(Duration::from_millis(50));
        let err = runner
            .output(&CommandLine::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdError::Timeout { .. }));
    }
}
