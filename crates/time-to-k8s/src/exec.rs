//! Process execution for benchmark phases.
//!
//! Runs a single external command to completion (or until its context is done),
//! capturing stdout, stderr, exit code and wall-clock duration. Never retries;
//! see [`crate::retry`] for that.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ttk_core::{CommandLine, CommandOutcome};

/// Timeout for draining stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from each of stdout and stderr.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Lines of output quoted in error messages.
const ERROR_TAIL_LINES: usize = 5;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(
        "`{}` exited with code {}: {}",
        .outcome,
        .outcome.exit_code,
        .outcome.output_tail(ERROR_TAIL_LINES)
    )]
    NonZeroExit { outcome: CommandOutcome },
    #[error("`{outcome}` did not complete before the deadline")]
    DeadlineExceeded { outcome: CommandOutcome },
    #[error("failed to start `{outcome}`: {source}")]
    Spawn {
        outcome: CommandOutcome,
        source: std::io::Error,
    },
    #[error("failed waiting for `{outcome}`: {source}")]
    Wait {
        outcome: CommandOutcome,
        source: std::io::Error,
    },
}

impl ExecError {
    /// Outcome of the failed command (duration is always populated).
    pub fn outcome(&self) -> &CommandOutcome {
        match self {
            Self::NonZeroExit { outcome }
            | Self::DeadlineExceeded { outcome }
            | Self::Spawn { outcome, .. }
            | Self::Wait { outcome, .. } => outcome,
        }
    }

    pub fn outcome_mut(&mut self) -> &mut CommandOutcome {
        match self {
            Self::NonZeroExit { outcome }
            | Self::DeadlineExceeded { outcome }
            | Self::Spawn { outcome, .. }
            | Self::Wait { outcome, .. } => outcome,
        }
    }

    pub fn into_outcome(self) -> CommandOutcome {
        match self {
            Self::NonZeroExit { outcome }
            | Self::DeadlineExceeded { outcome }
            | Self::Spawn { outcome, .. }
            | Self::Wait { outcome, .. } => outcome,
        }
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Deadline-bearing cancellation context shared by everything in one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    /// Context with no deadline; done only when cancelled.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context that is done `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derived context: cancelled with its parent, same deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(buf)
}

async fn collect_output(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &'static str,
) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let bytes = match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Run one command to completion.
///
/// Spawns exactly one process (never through a shell). If `ctx` becomes done
/// while it runs, the process is killed and `DeadlineExceeded` is returned.
pub async fn run_command(ctx: &RunContext, command: &CommandLine) -> Result<CommandOutcome> {
    let argv = command.argv();
    let started = Instant::now();

    if ctx.is_done() {
        return Err(ExecError::DeadlineExceeded {
            outcome: CommandOutcome::unfinished(argv, Duration::ZERO),
        });
    }

    debug!(command = %command, "running");

    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(source) => {
            return Err(ExecError::Spawn {
                outcome: CommandOutcome::unfinished(argv, started.elapsed()),
                source,
            });
        }
    };

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_bounded(out, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_bounded(err, MAX_OUTPUT_BYTES)));

    let status = tokio::select! {
        result = child.wait() => Some(result),
        () = ctx.done() => {
            debug!(command = %command, "context done; killing process");
            if let Err(err) = child.kill().await {
                warn!(command = %command, error = %err, "failed to kill process");
            }
            let _ = child.wait().await;
            None
        }
    };
    let duration = started.elapsed();

    let mut outcome = CommandOutcome {
        argv,
        stdout: collect_output(stdout_task, "stdout").await,
        stderr: collect_output(stderr_task, "stderr").await,
        exit_code: -1,
        duration,
        attempts: 1,
    };

    match status {
        None => Err(ExecError::DeadlineExceeded { outcome }),
        Some(Err(source)) => Err(ExecError::Wait { outcome, source }),
        Some(Ok(status)) => {
            outcome.exit_code = status.code().unwrap_or(-1);
            debug!(
                command = %command,
                exit_code = outcome.exit_code,
                duration_ms = duration.as_millis() as u64,
                "completed"
            );
            if !outcome.stderr.is_empty() {
                debug!(command = %command, stderr = %outcome.stderr.trim_end(), "stderr");
            }
            if status.success() {
                Ok(outcome)
            } else {
                Err(ExecError::NonZeroExit { outcome })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> CommandLine {
        CommandLine::parse(line).unwrap()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let ctx = RunContext::background();
        let outcome = run_command(&ctx, &cmd("echo hello world")).await.unwrap();
        assert_eq!(outcome.stdout, "hello world\n");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.argv, vec!["echo", "hello", "world"]);
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_code_and_stderr() {
        let ctx = RunContext::background();
        let command = CommandLine::new("sh")
            .arg("-c")
            .arg("echo boom >&2; exit 3");
        let err = run_command(&ctx, &command).await.unwrap_err();
        match &err {
            ExecError::NonZeroExit { outcome } => {
                assert_eq!(outcome.exit_code, 3);
                assert_eq!(outcome.stderr, "boom\n");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("exited with code 3"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let ctx = RunContext::background();
        let err = run_command(&ctx, &cmd("/nonexistent/ttk-no-such-binary --flag"))
            .await
            .unwrap_err();
        match err {
            ExecError::Spawn { outcome, source } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
                assert_eq!(outcome.exit_code, -1);
                assert_eq!(outcome.argv[1], "--flag");
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_process_and_records_duration() {
        let ctx = RunContext::with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = run_command(&ctx, &cmd("sleep 10")).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.is_deadline());
        let outcome = err.outcome();
        assert!(outcome.duration >= Duration::from_millis(150));
        assert_eq!(outcome.exit_code, -1);
    }

    #[tokio::test]
    async fn cancellation_stops_process() {
        let ctx = RunContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = run_command(&ctx, &cmd("sleep 10")).await.unwrap_err();
        assert!(err.is_deadline());
    }

    #[tokio::test]
    async fn done_context_does_not_spawn() {
        let ctx = RunContext::background();
        ctx.cancel();
        let err = run_command(&ctx, &cmd("true")).await.unwrap_err();
        assert!(err.is_deadline());
        assert_eq!(err.outcome().duration, Duration::ZERO);
    }

    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        let ctx = RunContext::background();
        let outcome = run_command(&ctx, &cmd("echo $HOME ; *")).await.unwrap();
        assert_eq!(outcome.stdout, "$HOME ; *\n");
    }

    #[test]
    fn child_context_follows_parent() {
        let parent = RunContext::with_timeout(Duration::from_secs(60));
        let child = parent.child();
        assert_eq!(child.deadline(), parent.deadline());
        assert!(!child.is_done());
        parent.cancel();
        assert!(child.is_done());
    }

    #[tokio::test]
    async fn read_bounded_truncates() {
        let data = vec![b'x'; 10_000];
        let buf = read_bounded(&data[..], 100).await.unwrap();
        assert_eq!(buf.len(), 100);
    }
}
