//! Deduplicating work queue with delayed and rate-limited adds.
//!
//! A key lives in at most one of three places: the ready `queue` (also in
//! `dirty`), `processing`, or both `processing` and `dirty` when it was re-added
//! while a worker held it. `done` moves such a key back to `queue`, so an update
//! that lands mid-reconcile is never lost and a key never has two workers.
//!
//! The queue is unbounded: adds never block, which keeps watch multiplexers free
//! of backpressure. Growth is bounded by the number of distinct keys.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backoff::RateLimiter;

struct Delayed<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}
impl<K> Eq for Delayed<K> {}
impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering { self.at.cmp(&other.at).then(self.seq.cmp(&other.seq)) }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: BinaryHeap<Reverse<Delayed<K>>>,
    /// Earliest pending ready time per delayed key; heap entries that disagree are stale.
    ready_at: FxHashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    available: Notify,
    drained: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(name: &str, limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: BinaryHeap::new(),
                ready_at: FxHashMap::default(),
                seq: 0,
                shutting_down: false,
            }),
            available: Notify::new(),
            drained: Notify::new(),
            limiter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if the key became ready for `get`.
    fn insert(st: &mut State<K>, key: K) -> bool {
        if st.dirty.contains(&key) {
            return false;
        }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            return false;
        }
        st.queue.push_back(key);
        true
    }

    fn promote(st: &mut State<K>, now: Instant) {
        while st.waiting.peek().map(|Reverse(d)| d.at <= now).unwrap_or(false) {
            let Some(Reverse(d)) = st.waiting.pop() else { break };
            if st.ready_at.get(&d.key) != Some(&d.at) {
                continue;
            }
            st.ready_at.remove(&d.key);
            Self::insert(st, d.key);
        }
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let ready = Self::insert(&mut st, key);
        gauge!("queue_depth", st.queue.len() as f64, "queue" => self.name.clone());
        drop(st);
        counter!("queue_adds_total", 1u64, "queue" => self.name.clone());
        if ready {
            self.available.notify_one();
        }
    }

    /// Make `key` ready after `delay`. A key already waiting keeps the earlier of the two times.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let at = Instant::now() + delay;
        if let Some(prev) = st.ready_at.get(&key) {
            if *prev <= at {
                return;
            }
        }
        st.ready_at.insert(key.clone(), at);
        st.seq += 1;
        let seq = st.seq;
        st.waiting.push(Reverse(Delayed { at, seq, key }));
        drop(st);
        // Wake a waiter so it re-arms its timer for the new deadline.
        self.available.notify_one();
    }

    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        counter!("queue_retries_total", 1u64, "queue" => self.name.clone());
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Next ready key, waiting as long as needed. `None` once shut down and the
    /// ready queue is empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.lock();
                Self::promote(&mut st, Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if !st.queue.is_empty() {
                        // Pass the wakeup on; promotion may have readied several keys.
                        self.available.notify_one();
                    }
                    gauge!("queue_depth", st.queue.len() as f64, "queue" => self.name.clone());
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.waiting.peek().map(|Reverse(d)| d.at)
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `key`. If it was re-added meanwhile it becomes ready again.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        let requeued = st.dirty.contains(key);
        if requeued {
            st.queue.push_back(key.clone());
        }
        let drained = st.shutting_down && st.processing.is_empty() && st.queue.is_empty();
        drop(st);
        if requeued {
            self.available.notify_one();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys handed out and not yet `done`.
    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Stop accepting adds and drop delayed items. Ready keys are still handed out.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        st.shutting_down = true;
        st.waiting.clear();
        st.ready_at.clear();
        drop(st);
        self.available.notify_waiters();
    }

    /// `shut_down`, then wait until every ready and in-flight key is done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let st = self.lock();
                if st.processing.is_empty() && st.queue.is_empty() {
                    return;
                }
            }
            drained.await;
        }
    }
}
