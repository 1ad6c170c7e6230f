//! Privileged command execution.
//!
//! Every interaction with the `tailscale` binary goes through a root shell
//! (`su -c "<command>"`). The executor contract is total: it never returns an
//! error, spawn failures are turned into a diagnostic string that takes the
//! place of the command output.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Captured result of one shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process was killed by a signal or never started.
    pub code: Option<i32>,
}

impl ExecOutput {
    pub fn spawn_failure(command: &str, err: std::io::Error) -> Self {
        ExecOutput {
            stdout: String::new(),
            stderr: format!("failed to execute `{command}`: {err}"),
            code: None,
        }
    }

    /// Both streams joined by a newline and trimmed. Callers must not assume
    /// the meaningful text is on either particular stream.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `command` to completion and captures both output streams.
    async fn run(&self, command: &str) -> ExecOutput;

    /// Runs `command` and returns the combined, trimmed output.
    async fn execute(&self, command: &str) -> String {
        self.run(command).await.combined()
    }
}

/// Executes commands through a privilege-elevating shell wrapper.
#[derive(Debug, Clone)]
pub struct RootShell {
    program: String,
    flag: String,
}

impl Default for RootShell {
    fn default() -> Self {
        RootShell {
            program: "su".to_string(),
            flag: "-c".to_string(),
        }
    }
}

impl RootShell {
    pub fn new(program: impl Into<String>, flag: impl Into<String>) -> Self {
        RootShell {
            program: program.into(),
            flag: flag.into(),
        }
    }

    /// Runs a long-lived `command`, forwarding stdout and stderr line by line
    /// to `lines` as they appear. Returns the exit code. Dropping the future
    /// kills the command.
    pub async fn stream(&self, command: &str, lines: mpsc::Sender<String>) -> Result<Option<i32>> {
        debug!(program = %self.program, command, "streaming");
        let mut child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let readers = [
            forward_lines(child.stdout.take(), lines.clone()),
            forward_lines(child.stderr.take(), lines),
        ];
        let status = child.wait().await?;
        for reader in readers.into_iter().flatten() {
            let _ = reader.await;
        }
        Ok(status.code())
    }

    /// Builds the wrapper invocation for `command` without spawning it.
    pub fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.flag).arg(command).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for RootShell {
    async fn run(&self, command: &str) -> ExecOutput {
        debug!(program = %self.program, command, "spawning");
        let child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(command, error = %e, "could not spawn root shell");
                return ExecOutput::spawn_failure(command, e);
            }
        };

        // dropping this future mid-wait kills the child (kill_on_drop)
        match child.wait_with_output().await {
            Ok(output) => ExecOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code(),
            },
            Err(e) => {
                warn!(command, error = %e, "failed waiting on root shell");
                ExecOutput::spawn_failure(command, e)
            }
        }
    }
}

fn forward_lines<R>(stream: Option<R>, lines: mpsc::Sender<String>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).await.is_err() {
                break;
            }
        }
    }))
}

/// Single-quotes `arg` for `sh -c` command strings.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Checks that the shell wrapper actually grants root.
pub async fn has_root(exec: &dyn CommandExecutor) -> bool {
    exec.execute("id").await.contains("uid=0")
}
