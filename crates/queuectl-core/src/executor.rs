//! The Executor (`# 4.3`): runs a claimed job's command with a hard
//! wall-clock deadline and classifies the outcome. Produces no Store side
//! effects; it hands an [`Outcome`] back to the worker loop.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::job::Job;

/// Bounded tail of captured stderr kept in `error_message` on failure.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// The classified result of running one job's command once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exited with code 0 within the deadline.
    Success,
    /// Any of: non-zero exit, deadline exceeded, spawn/transport failure.
    /// `message` is what `# 3`'s `error_message` field will store.
    RetryableFailure { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Runs jobs' shell commands via the host command interpreter.
///
/// Per the `# 9` resolution of the command-execution open question, this
/// keeps host-shell invocation (`sh -c <command>`) rather than an `argv`
/// boundary: `command` is documented as an opaque string and sandboxing the
/// executed command is an explicit Non-goal.
#[derive(Debug, Default, Clone, Copy)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Executor
    }

    /// Run `job.command` under `sh -c`, enforcing `job.effective_timeout_seconds()`
    /// as a hard deadline. The child is killed if the deadline elapses.
    pub async fn run(&self, job: &Job) -> Outcome {
        let timeout = Duration::from_secs(job.effective_timeout_seconds().max(0) as u64);

        let spawn = Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to spawn job command");
                return Outcome::RetryableFailure {
                    message: format!("spawn error: {e}"),
                };
            }
        };

        let mut stderr_pipe = child.stderr.take();

        let wait = tokio::time::timeout(timeout, child.wait());

        match wait.await {
            Ok(Ok(status)) => {
                let stderr_tail = read_stderr_tail(&mut stderr_pipe).await;
                if status.success() {
                    debug!(job_id = %job.id, "job command exited 0");
                    Outcome::Success
                } else {
                    let code_desc = status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    let message = if stderr_tail.is_empty() {
                        format!("exit code {code_desc}")
                    } else {
                        format!("exit code {code_desc}: {stderr_tail}")
                    };
                    warn!(job_id = %job.id, exit = %code_desc, "job command failed");
                    Outcome::RetryableFailure { message }
                }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "failed to wait on job command");
                Outcome::RetryableFailure {
                    message: format!("wait error: {e}"),
                }
            }
            Err(_) => {
                warn!(job_id = %job.id, timeout_seconds = job.effective_timeout_seconds(), "job command exceeded deadline, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Outcome::RetryableFailure {
                    message: format!(
                        "timeout: exceeded {}s deadline",
                        job.effective_timeout_seconds()
                    ),
                }
            }
        }
    }
}

/// Read up to [`STDERR_TAIL_BYTES`] of the child's stderr, keeping only the
/// final bytes if it produced more than that (a bounded tail, not a head).
async fn read_stderr_tail(pipe: &mut Option<tokio::process::ChildStderr>) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    if pipe.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }
    let tail_start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[tail_start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn job_with_command(command: &str) -> Job {
        Job::new("t", command)
    }

    #[tokio::test]
    async fn success_on_exit_zero() {
        let executor = Executor::new();
        let outcome = executor.run(&job_with_command("true")).await;
        assert_eq!(outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn retryable_on_nonzero_exit() {
        let executor = Executor::new();
        let outcome = executor.run(&job_with_command("false")).await;
        match outcome {
            Outcome::RetryableFailure { message } => {
                assert!(message.contains("exit code"));
            }
            Outcome::Success => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn retryable_on_command_not_found() {
        let executor = Executor::new();
        let outcome = executor
            .run(&job_with_command("this-binary-does-not-exist-anywhere"))
            .await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn captures_stderr_tail_on_failure() {
        let executor = Executor::new();
        let outcome = executor
            .run(&job_with_command("echo boom 1>&2; exit 1"))
            .await;
        match outcome {
            Outcome::RetryableFailure { message } => assert!(message.contains("boom")),
            Outcome::Success => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn retryable_on_timeout_and_kills_process() {
        let executor = Executor::new();
        let job = job_with_command("sleep 5").with_timeout_seconds(1);
        let started = std::time::Instant::now();
        let outcome = executor.run(&job).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        match outcome {
            Outcome::RetryableFailure { message } => assert!(message.contains("timeout")),
            Outcome::Success => panic!("expected timeout failure"),
        }
    }
}
