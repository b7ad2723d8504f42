//! Keel store: in-memory versioned object store.
//!
//! Behaves like a single API server backed by one revision counter: every
//! mutation bumps the revision, stale writes are rejected, watches resume from
//! any retained revision, and deleting an owner garbage-collects dependents.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use keel_core::{
    EventStream, Gvk, Object, ObjectList, ObjectStore, Selector, StoreError, StoreResult, WatchEvent,
};
use metrics::counter;
use tokio::sync::{broadcast, watch};
use tracing::debug;

type ObjKey = (Gvk, Option<String>, String);

#[derive(Debug, Clone)]
struct Stamped {
    rev: u64,
    event: WatchEvent,
}

/// Write counters, for asserting that reconciliation converges without churn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub deletes: u64,
}

impl WriteStats {
    pub fn total(&self) -> u64 { self.creates + self.updates + self.status_updates + self.deletes }
}

struct Inner {
    objects: BTreeMap<ObjKey, Object>,
    revision: u64,
    history: VecDeque<Stamped>,
    history_cap: usize,
    /// Watches resuming from a revision below this fail with `Gone`.
    compacted: u64,
    stats: WriteStats,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Stamped>,
    /// Bumped to drop every open watch stream (simulated disconnect).
    epoch: watch::Sender<u64>,
    gc: bool,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self { Self::with_history(1024) }

    pub fn with_history(history_cap: usize) -> Self {
        let (events, _) = broadcast::channel(history_cap.max(16));
        let (epoch, _) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                history_cap: history_cap.max(1),
                compacted: 0,
                stats: WriteStats::default(),
            }),
            events,
            epoch,
            gc: true,
        }
    }

    /// A store without an owner garbage collector; dependents outlive their owners.
    pub fn without_gc() -> Self {
        let mut s = Self::new();
        s.gc = false;
        s
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> WriteStats { self.lock().stats }

    pub fn revision(&self) -> u64 { self.lock().revision }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop all retained history; resuming from any earlier revision yields `Gone`.
    pub fn compact(&self) {
        let mut inner = self.lock();
        inner.compacted = inner.revision;
        inner.history.clear();
        debug!(revision = inner.revision, "store compacted");
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watches(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    fn emit(&self, inner: &mut Inner, event: WatchEvent) {
        let st = Stamped { rev: inner.revision, event };
        if inner.history.len() >= inner.history_cap {
            if let Some(old) = inner.history.pop_front() {
                inner.compacted = inner.compacted.max(old.rev);
            }
        }
        inner.history.push_back(st.clone());
        // No receivers is fine.
        let _ = self.events.send(st);
    }

    fn bump(inner: &mut Inner) -> String {
        inner.revision += 1;
        inner.revision.to_string()
    }

    fn check_version(cur: &Object, submitted: &Object) -> StoreResult<()> {
        match submitted.resource_version() {
            Some(v) if Some(v) != cur.resource_version() => Err(StoreError::Conflict(format!(
                "{} (expected rv {}, stored rv {})",
                cur.key(),
                v,
                cur.resource_version().unwrap_or("")
            ))),
            _ => Ok(()),
        }
    }

    /// Remove `key` and, if enabled, cascade through dependents owned by it.
    fn remove_locked(&self, inner: &mut Inner, key: ObjKey) {
        let mut pending = vec![key];
        while let Some(k) = pending.pop() {
            let Some(mut gone) = inner.objects.remove(&k) else { continue };
            gone.meta.resource_version = Some(Self::bump(inner));
            inner.stats.deletes += 1;
            let owner_uid = gone.meta.uid.clone();
            self.emit(inner, WatchEvent::Deleted(gone));
            let Some(owner_uid) = owner_uid.filter(|_| self.gc) else { continue };

            let dependents: Vec<ObjKey> = inner
                .objects
                .iter()
                .filter(|(_, o)| o.meta.owner_references.iter().any(|r| r.uid == owner_uid))
                .map(|(k, _)| k.clone())
                .collect();
            for dk in dependents {
                let Some(mut dep) = inner.objects.get(&dk).cloned() else { continue };
                dep.meta.owner_references.retain(|r| r.uid != owner_uid);
                if !dep.meta.owner_references.is_empty() {
                    dep.meta.resource_version = Some(Self::bump(inner));
                    inner.objects.insert(dk, dep.clone());
                    self.emit(inner, WatchEvent::Modified(dep));
                } else if !dep.meta.finalizers.is_empty() {
                    if dep.meta.deletion_timestamp.is_none() {
                        dep.meta.deletion_timestamp = Some(now());
                    }
                    dep.meta.resource_version = Some(Self::bump(inner));
                    inner.objects.insert(dk, dep.clone());
                    self.emit(inner, WatchEvent::Modified(dep));
                } else {
                    debug!(dependent = %dep.key(), "garbage collecting orphaned dependent");
                    counter!("store_gc_deleted_total", 1u64);
                    pending.push(dk);
                }
            }
        }
    }
}

fn now() -> String { chrono::Utc::now().to_rfc3339() }

fn obj_key(gvk: &Gvk, namespace: Option<&str>, name: &str) -> ObjKey {
    (gvk.clone(), namespace.map(|s| s.to_string()), name.to_string())
}

fn key_of(o: &Object) -> ObjKey { (o.gvk.clone(), o.meta.namespace.clone(), o.meta.name.clone()) }

#[derive(Clone)]
struct Filter {
    gvk: Gvk,
    namespace: Option<String>,
    selector: Selector,
}

impl Filter {
    fn matches(&self, o: &Object) -> bool {
        o.gvk == self.gvk
            && (self.namespace.is_none() || self.namespace == o.meta.namespace)
            && self.selector.matches(&o.meta.labels)
    }

    fn matches_event(&self, ev: &WatchEvent) -> bool {
        ev.object().map(|o| self.matches(o)).unwrap_or(false)
    }
}

fn parse_rv(rv: &str) -> StoreResult<Option<u64>> {
    if rv.is_empty() || rv == "0" {
        return Ok(None);
    }
    rv.parse::<u64>().map(Some).map_err(|_| StoreError::Invalid(format!("bad resourceVersion {:?}", rv)))
}

struct LiveState {
    rx: broadcast::Receiver<Stamped>,
    epoch: watch::Receiver<u64>,
    filter: Filter,
    after: u64,
    done: bool,
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<Option<Object>> {
        Ok(self.lock().objects.get(&obj_key(gvk, namespace, name)).cloned())
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector) -> StoreResult<ObjectList> {
        let inner = self.lock();
        let filter = Filter { gvk: gvk.clone(), namespace: namespace.map(|s| s.to_string()), selector: selector.clone() };
        let items = inner.objects.values().filter(|o| filter.matches(o)).cloned().collect();
        Ok(ObjectList { items, resource_version: inner.revision.to_string() })
    }

    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector, resource_version: &str) -> StoreResult<EventStream> {
        let filter = Filter { gvk: gvk.clone(), namespace: namespace.map(|s| s.to_string()), selector: selector.clone() };
        let since = parse_rv(resource_version)?;
        // Subscribe before reading history so nothing falls between the two.
        let rx = self.events.subscribe();
        let epoch = self.epoch.subscribe();
        let (backlog, after) = {
            let inner = self.lock();
            let since = since.unwrap_or(inner.revision);
            if since < inner.compacted {
                return Err(StoreError::Gone(format!("revision {} compacted (oldest {})", since, inner.compacted)));
            }
            let backlog: Vec<StoreResult<WatchEvent>> = inner
                .history
                .iter()
                .filter(|s| s.rev > since && filter.matches_event(&s.event))
                .map(|s| Ok(s.event.clone()))
                .collect();
            (backlog, inner.revision)
        };

        let state = LiveState { rx, epoch, filter, after, done: false };
        let live = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                tokio::select! {
                    _ = st.epoch.changed() => return None,
                    r = st.rx.recv() => match r {
                        Ok(s) => {
                            if s.rev <= st.after || !st.filter.matches_event(&s.event) { continue; }
                            return Some((Ok(s.event), st));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            st.done = true;
                            return Some((Err(StoreError::Gone(format!("watch fell behind by {} events", n))), st));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }

    async fn create(&self, obj: &Object) -> StoreResult<Object> {
        if obj.meta.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".into()));
        }
        let mut inner = self.lock();
        let key = key_of(obj);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(obj.key().to_string()));
        }
        let mut stored = obj.clone();
        stored.meta.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.meta.resource_version = Some(Self::bump(&mut inner));
        stored.meta.generation = Some(1);
        stored.meta.creation_timestamp = Some(now());
        stored.meta.deletion_timestamp = None;
        inner.objects.insert(key, stored.clone());
        inner.stats.creates += 1;
        self.emit(&mut inner, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &Object) -> StoreResult<Object> {
        let mut inner = self.lock();
        let key = key_of(obj);
        let cur = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(obj.key().to_string()))?;
        Self::check_version(&cur, obj)?;

        let mut next = cur.clone();
        next.meta.labels = obj.meta.labels.clone();
        next.meta.annotations = obj.meta.annotations.clone();
        next.meta.owner_references = obj.meta.owner_references.clone();
        next.meta.finalizers = obj.meta.finalizers.clone();
        next.body = obj.desired_body();
        if let Some(status) = cur.status() {
            next.set_status(status.clone());
        }
        if next == cur {
            return Ok(cur);
        }
        if next.spec() != cur.spec() {
            next.meta.generation = Some(cur.meta.generation.unwrap_or(0) + 1);
        }
        if next.meta.is_deleting() && next.meta.finalizers.is_empty() {
            inner.stats.updates += 1;
            self.remove_locked(&mut inner, key);
            return Ok(next);
        }
        next.meta.resource_version = Some(Self::bump(&mut inner));
        inner.objects.insert(key, next.clone());
        inner.stats.updates += 1;
        self.emit(&mut inner, WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    async fn update_status(&self, obj: &Object) -> StoreResult<Object> {
        let mut inner = self.lock();
        let key = key_of(obj);
        let cur = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(obj.key().to_string()))?;
        Self::check_version(&cur, obj)?;
        let mut next = cur.clone();
        match obj.status() {
            Some(s) => next.set_status(s.clone()),
            None => {
                next.body.remove("status");
            }
        }
        if next == cur {
            return Ok(cur);
        }
        next.meta.resource_version = Some(Self::bump(&mut inner));
        inner.objects.insert(key, next.clone());
        inner.stats.status_updates += 1;
        self.emit(&mut inner, WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let key = obj_key(gvk, namespace, name);
        let mut cur = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", gvk, namespace.unwrap_or("-"), name)))?;
        if !cur.meta.finalizers.is_empty() {
            if cur.meta.deletion_timestamp.is_none() {
                cur.meta.deletion_timestamp = Some(now());
                cur.meta.resource_version = Some(Self::bump(&mut inner));
                inner.objects.insert(key, cur.clone());
                self.emit(&mut inner, WatchEvent::Modified(cur));
            }
            return Ok(());
        }
        self.remove_locked(&mut inner, key);
        Ok(())
    }
}
