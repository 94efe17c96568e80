//! Local compiler subprocess execution.
//!
//! The engine races the remote path against a local subprocess under the
//! fast-fallback policy, re-runs locally after remote failures, and runs a
//! comparison build under the verify policy. All of that goes through the
//! [`SubprocessHost`] seam so tests can substitute a scripted runner.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use cpx_common::errors::TaskError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// One local compiler invocation.
#[derive(Debug, Clone)]
pub struct LocalCommand {
    pub program: PathBuf,
    /// argv[0] included.
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Run niced so the remote path keeps its head start.
    pub low_priority: bool,
    /// Hold-off before the process is actually spawned. Cancellation
    /// during the hold-off means the subprocess never starts.
    pub start_delay: Duration,
}

/// Result of a completed local run.
#[derive(Debug, Clone)]
pub struct LocalOutcome {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl LocalOutcome {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Capability to run and kill local compiler processes.
#[async_trait]
pub trait SubprocessHost: Send + Sync {
    /// Run `cmd` to completion. Returns [`TaskError::Cancelled`] if
    /// `cancel` fires first; the process (if started) is killed.
    async fn run(&self, cmd: LocalCommand, cancel: CancelToken) -> Result<LocalOutcome, TaskError>;
}

/// Production host backed by `tokio::process`.
pub struct TokioSubprocessHost;

#[async_trait]
impl SubprocessHost for TokioSubprocessHost {
    async fn run(&self, cmd: LocalCommand, cancel: CancelToken) -> Result<LocalOutcome, TaskError> {
        if !cmd.start_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(program = %cmd.program.display(), "local run cancelled before start");
                    return Err(TaskError::Cancelled);
                }
                _ = tokio::time::sleep(cmd.start_delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let mut command = if cmd.low_priority && cfg!(unix) {
            let mut c = tokio::process::Command::new("nice");
            c.arg("-n").arg("10").arg(&cmd.program);
            c
        } else {
            tokio::process::Command::new(&cmd.program)
        };
        command
            .args(cmd.argv.iter().skip(1))
            .current_dir(&cmd.cwd)
            .envs(cmd.env.iter().cloned())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| TaskError::LocalRun(format!("spawn {}: {e}", cmd.program.display())))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the wait future drops the child, which kills it.
                debug!(program = %cmd.program.display(), "local run killed by cancellation");
                Err(TaskError::Cancelled)
            }
            output = child.wait_with_output() => {
                let output = output
                    .map_err(|e| TaskError::LocalRun(format!("wait: {e}")))?;
                Ok(LocalOutcome {
                    exit_status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}
