//! Controller tuning, read from `KEEL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Deadline for one reconcile call; expiry counts as a failure.
    pub reconcile_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub qps: f64,
    pub burst: u32,
    /// Re-enqueue every known key on this period.
    pub resync: Option<Duration>,
    pub watch_backoff_max: Duration,
    /// Consecutive watch failures before connectivity loss is reported.
    pub watch_failure_threshold: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reconcile_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            resync: None,
            watch_backoff_max: Duration::from_secs(30),
            watch_failure_threshold: 5,
        }
    }
}

fn env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env::<usize>("KEEL_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            reconcile_timeout: env("KEEL_RECONCILE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.reconcile_timeout),
            backoff_base: env("KEEL_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env("KEEL_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            qps: env::<f64>("KEEL_QUEUE_QPS").filter(|q| *q > 0.0).unwrap_or(d.qps),
            burst: env("KEEL_QUEUE_BURST").unwrap_or(d.burst),
            resync: env::<u64>("KEEL_RESYNC_SECS").filter(|s| *s > 0).map(Duration::from_secs).or(d.resync),
            watch_backoff_max: env("KEEL_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            watch_failure_threshold: env("KEEL_WATCH_FAILURE_THRESHOLD").unwrap_or(d.watch_failure_threshold),
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period;
        self
    }

    pub fn reconcile_timeout(mut self, d: Duration) -> Self {
        self.reconcile_timeout = d;
        self
    }
}
