//! Retrying executor.
//!
//! Re-issues a command at a fixed poll interval until it succeeds, the context
//! is done, or the attempt ceiling is reached. The returned duration is the sum
//! of every attempt, i.e. the time it took to eventually succeed.

use crate::exec::{run_command, ExecError, Result, RunContext};
use std::time::Duration;
use tracing::{debug, info};
use ttk_core::{CommandLine, CommandOutcome};

/// Default pause between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default maximum number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Attempt ceiling (values below 1 behave as 1).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn accumulate(outcome: &mut CommandOutcome, elapsed: &mut Duration, attempts: u32) {
    *elapsed += outcome.duration;
    outcome.duration = *elapsed;
    outcome.attempts = attempts;
}

/// Run `command` until it succeeds.
///
/// Spawn failures are returned immediately: a missing binary will not appear
/// between polls.
pub async fn run_until_success(
    ctx: &RunContext,
    command: &CommandLine,
    policy: &RetryPolicy,
) -> Result<CommandOutcome> {
    info!(command = %command, "running until it succeeds");

    let max_attempts = policy.max_attempts.max(1);
    let mut elapsed = Duration::ZERO;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match run_command(ctx, command).await {
            Ok(mut outcome) => {
                accumulate(&mut outcome, &mut elapsed, attempts);
                debug!(
                    command = %command,
                    attempts,
                    duration_ms = elapsed.as_millis() as u64,
                    "succeeded"
                );
                return Ok(outcome);
            }
            Err(mut err) => {
                accumulate(err.outcome_mut(), &mut elapsed, attempts);

                if matches!(err, ExecError::DeadlineExceeded { .. } | ExecError::Spawn { .. }) {
                    return Err(err);
                }
                if attempts >= max_attempts {
                    info!(command = %command, attempts, error = %err, "giving up");
                    return Err(err);
                }
                debug!(command = %command, attempts, error = %err, "attempt failed");

                tokio::select! {
                    () = ctx.done() => {}
                    () = tokio::time::sleep(policy.interval) => {}
                }
                if ctx.is_done() {
                    return Err(ExecError::DeadlineExceeded {
                        outcome: err.into_outcome(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// Script that logs each invocation and fails until the `succeed_after`-th.
    fn flaky_script(dir: &Path, succeed_after: u32, sleep: &str) -> (CommandLine, PathBuf) {
        let log = dir.join("attempts.log");
        let script = write_script(
            dir,
            "flaky.sh",
            &format!(
                r#"echo x >> "{log}"
n=$(wc -l < "{log}" | tr -d ' ')
sleep {sleep}
if [ "$n" -le {fails} ]; then
    echo "not yet ($n)" >&2
    exit 1
fi
echo ready
"#,
                log = log.display(),
                fails = succeed_after,
            ),
        );
        (CommandLine::new(script.display().to_string()), log)
    }

    fn attempts_logged(log: &Path) -> usize {
        std::fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn succeeds_after_k_failures_and_sums_durations() {
        let dir = TempDir::new().unwrap();
        let (command, log) = flaky_script(dir.path(), 3, "0.05");
        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 100,
        };

        let outcome = run_until_success(&RunContext::background(), &command, &policy)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 4);
        assert_eq!(attempts_logged(&log), 4);
        assert_eq!(outcome.stdout, "ready\n");
        // Four attempts of at least 50ms each.
        assert!(outcome.duration >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn gives_up_after_exactly_max_attempts() {
        let dir = TempDir::new().unwrap();
        let (command, log) = flaky_script(dir.path(), u32::MAX / 2, "0");
        let policy = RetryPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 7,
        };

        let err = run_until_success(&RunContext::background(), &command, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::NonZeroExit { .. }));
        assert_eq!(err.outcome().attempts, 7);
        assert_eq!(err.outcome().exit_code, 1);
        assert!(err.outcome().stderr.contains("not yet (7)"));
        assert_eq!(attempts_logged(&log), 7);
    }

    #[tokio::test]
    async fn zero_ceiling_still_makes_one_attempt() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 0,
        };
        let err = run_until_success(&RunContext::background(), &CommandLine::new("false"), &policy)
            .await
            .unwrap_err();
        assert_eq!(err.outcome().attempts, 1);
    }

    #[tokio::test]
    async fn deadline_stops_retrying() {
        let ctx = RunContext::with_timeout(Duration::from_millis(300));
        let policy = RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        let started = std::time::Instant::now();

        let err = run_until_success(&ctx, &CommandLine::new("false"), &policy)
            .await
            .unwrap_err();

        assert!(err.is_deadline());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.outcome().attempts > 1);
        assert!(err.outcome().attempts < DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn spawn_failure_is_not_retried() {
        let policy = RetryPolicy::default();
        let err = run_until_success(
            &RunContext::background(),
            &CommandLine::new("/nonexistent/ttk-kubectl"),
            &policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
        assert_eq!(err.outcome().attempts, 1);
    }

    #[test]
    fn default_policy_matches_reference_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 5000);
    }
}
