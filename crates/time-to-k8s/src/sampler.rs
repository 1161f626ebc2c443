//! Background host CPU sampler.
//!
//! Integrates the host's CPU busy fraction over a sequence's wall-clock span by
//! reading `/proc/stat` once per interval. Each interval's jiffy deltas are
//! summed; an interval whose counters went backwards (CPU hotplug, counter
//! reset) is dropped. The owner cancels and joins the task before reading the
//! value. Hosts without `/proc/stat` yield `None`.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

const PROC_STAT: &str = "/proc/stat";

/// Aggregate CPU jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Parse the aggregate `cpu` line. Idle time is `idle + iowait`.
fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 4 {
        return None;
    }
    // guest and guest_nice are already counted in user and nice.
    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn read_cpu_times() -> Option<CpuTimes> {
    std::fs::read_to_string(PROC_STAT)
        .ok()
        .and_then(|c| parse_proc_stat(&c))
}

/// Sum of busy and total jiffies over the accepted intervals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BusyIntegral {
    busy: u64,
    total: u64,
    dropped: u32,
}

impl BusyIntegral {
    /// Add the interval `prev..now`, returning its own busy fraction.
    fn add(&mut self, prev: CpuTimes, now: CpuTimes) -> Option<f64> {
        let (Some(total), Some(busy)) = (
            now.total.checked_sub(prev.total),
            now.busy.checked_sub(prev.busy),
        ) else {
            self.dropped += 1;
            return None;
        };
        if total == 0 {
            return None;
        }
        self.busy += busy.min(total);
        self.total += total;
        Some(busy.min(total) as f64 / total as f64)
    }

    fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| (self.busy as f64 / self.total as f64).clamp(0.0, 1.0))
    }
}

/// Handle to a running sampler task.
#[derive(Debug)]
pub struct CpuSampler {
    token: CancellationToken,
    handle: JoinHandle<Option<f64>>,
}

impl CpuSampler {
    /// Start sampling until `token` (or [`CpuSampler::finish`]) cancels it.
    pub fn start(token: CancellationToken, interval: Duration) -> Self {
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut prev = read_cpu_times()?;
            let mut integral = BusyIntegral::default();
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(now) = read_cpu_times() {
                            let busy = integral.add(prev, now);
                            trace!(busy = ?busy, "cpu sample");
                            prev = now;
                        }
                    }
                }
            }

            if let Some(end) = read_cpu_times() {
                integral.add(prev, end);
            }
            if integral.dropped > 0 {
                debug!(dropped = integral.dropped, "cpu counters went backwards");
            }
            integral.fraction()
        });
        Self { token, handle }
    }

    /// Stop the sampler and return the busy fraction over its lifetime.
    pub async fn finish(self) -> Option<f64> {
        self.token.cancel();
        match self.handle.await {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "cpu sampler task failed");
                None
            }
        }
    }
}
