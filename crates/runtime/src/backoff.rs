//! Rate limiters deciding how long a failed key waits before its next attempt.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be retried; records one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Reset any per-key state.
    fn forget(&self, key: &K);
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ExponentialFailure<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialFailure<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialFailure<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = (*n).min(62) as i32;
        *n = n.saturating_add(1);
        let secs = self.base.as_secs_f64() * 2f64.powi(exp);
        if secs >= self.max.as_secs_f64() { self.max } else { Duration::from_secs_f64(secs) }
    }

    fn forget(&self, key: &K) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).get(key).copied().unwrap_or(0)
    }
}

/// Slowest refill a bucket accepts; keeps owed time within `Duration`.
const MIN_QPS: f64 = 1e-3;

/// Overall token bucket shared by all keys: `qps` refill, `burst` capacity.
pub struct Bucket {
    qps: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl Bucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        let qps = if qps.is_nan() { MIN_QPS } else { qps.clamp(MIN_QPS, f64::MAX) };
        Self { qps, burst, state: Mutex::new((burst, Instant::now())) }
    }
}

impl<K> RateLimiter<K> for Bucket {
    fn when(&self, _key: &K) -> Duration {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let refill = now.saturating_duration_since(st.1).as_secs_f64() * self.qps;
        st.0 = (st.0 + refill).min(self.burst);
        st.1 = now;
        // Reserve a token; a negative balance is time owed.
        st.0 -= 1.0;
        if st.0 >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-st.0 / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Longest delay of all members.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential failure backoff combined with an overall bucket.
pub fn default_limiter<K>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOf<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOf::new(vec![Box::new(ExponentialFailure::new(base, max)), Box::new(Bucket::new(qps, burst))])
}
