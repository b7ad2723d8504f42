//! Keel apply: idempotent create-or-update of desired objects against an
//! `ObjectStore`, plus status writes, pruning and manifest loading.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_core::{Object, ObjectStore, OwnerError, ReconcileError, Registry, StoreError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

pub mod manifest;
mod prune;

pub use manifest::{parse_manifest, FileManifestLoader, ManifestError, ManifestLoader, StaticManifests};

fn max_apply_attempts() -> u32 {
    std::env::var("KEEL_APPLY_MAX_ATTEMPTS").ok().and_then(|s| s.parse::<u32>().ok()).filter(|n| *n > 0).unwrap_or(5)
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid desired object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Owner(#[from] OwnerError),
    #[error("{key}: still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { key: String, attempts: u32 },
}

impl From<ApplyError> for ReconcileError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Store(s) => ReconcileError::Store(s),
            ApplyError::Invalid(m) => ReconcileError::Permanent(m),
            ApplyError::Owner(o) => o.into(),
            e @ ApplyError::ConflictRetriesExhausted { .. } => ReconcileError::Transient(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub outcome: ApplyOutcome,
    /// The stored object after the call.
    pub object: Object,
    pub summary: DiffSummary,
    pub attempts: u32,
}

impl ApplyResult {
    pub fn new_rv(&self) -> Option<&str> { self.object.resource_version() }
    pub fn changed(&self) -> bool { self.outcome != ApplyOutcome::Unchanged }
}

/// Pushes desired objects into the store. Cheap to clone.
#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn ObjectStore>,
    registry: Arc<Registry>,
    max_attempts: u32,
}

impl Applier {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry, max_attempts: max_apply_attempts() }
    }

    /// Total read-compare-write cycles before a conflict is surfaced.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }
    pub fn registry(&self) -> &Registry { &self.registry }
    pub fn max_attempts(&self) -> u32 { self.max_attempts }

    fn validate(&self, desired: &Object) -> Result<(), ApplyError> {
        match self.registry.validate(desired) {
            Ok(()) => Ok(()),
            Err(StoreError::Invalid(m)) => Err(ApplyError::Invalid(m)),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `desired`, or bring the live object's fields in line with it.
    /// Fields the desired object does not mention are left alone; `status` is
    /// never written. No write happens when nothing differs.
    pub async fn apply(&self, desired: &Object) -> Result<ApplyResult, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        self.validate(desired)?;
        let key = desired.key();
        let res = self.apply_loop(desired).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => {
                counter!("apply_ok", 1u64);
                debug!(key = %key, outcome = ?r.outcome, attempts = r.attempts, adds = r.summary.adds, updates = r.summary.updates, "applied");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                debug!(key = %key, error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_loop(&self, desired: &Object) -> Result<ApplyResult, ApplyError> {
        let gvk = &desired.gvk;
        for attempt in 1..=self.max_attempts {
            let live = self.store.get(gvk, desired.namespace(), desired.name()).await?;
            let Some(live) = live else {
                match self.store.create(&for_create(desired)).await {
                    Ok(object) => {
                        let summary = diff_summary(&strip_noisy(object.to_json()), &Json::Null);
                        return Ok(ApplyResult { outcome: ApplyOutcome::Created, object, summary, attempts: attempt });
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(key = %desired.key(), "lost create race; retrying as update");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            check_controller(&live, desired)?;
            let merged = overlay(&live, desired);
            if merged == live {
                return Ok(ApplyResult { outcome: ApplyOutcome::Unchanged, object: live, summary: DiffSummary::default(), attempts: attempt });
            }
            let summary = diff_summary(&strip_noisy(merged.to_json()), &strip_noisy(live.to_json()));
            match self.store.update(&merged).await {
                Ok(object) => return Ok(ApplyResult { outcome: ApplyOutcome::Updated, object, summary, attempts: attempt }),
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    counter!("apply_conflicts_total", 1u64);
                    debug!(key = %desired.key(), attempt, error = %e, "apply raced another writer");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApplyError::ConflictRetriesExhausted { key: desired.key().to_string(), attempts: self.max_attempts })
    }

    /// `apply` after making `owner` the desired object's controller.
    pub async fn apply_owned(&self, owner: &Object, mut desired: Object) -> Result<ApplyResult, ApplyError> {
        desired.set_controller_owner(owner)?;
        self.apply(&desired).await
    }

    /// Write `status` through the status subresource if it differs from what
    /// `current` (or, after a conflict, the re-read object) carries.
    pub async fn apply_status(&self, current: &Object, status: Json) -> Result<Object, ApplyError> {
        self.update_with_retry(current, true, |o| {
            if o.status() == Some(&status) {
                return false;
            }
            o.set_status(status.clone());
            true
        })
        .await
    }

    /// Edit-and-write with optimistic concurrency. `edit` returns false when no
    /// write is needed; on conflict the object is re-read and edited again.
    pub(crate) async fn update_with_retry<F>(&self, start: &Object, status: bool, mut edit: F) -> Result<Object, ApplyError>
    where
        F: FnMut(&mut Object) -> bool + Send,
    {
        let mut cur = start.clone();
        for _ in 0..self.max_attempts {
            let mut next = cur.clone();
            if !edit(&mut next) {
                return Ok(cur);
            }
            let res = if status { self.store.update_status(&next).await } else { self.store.update(&next).await };
            match res {
                Ok(o) => return Ok(o),
                Err(e) if e.is_conflict() => {
                    counter!("apply_conflicts_total", 1u64);
                    cur = self
                        .store
                        .get(&cur.gvk, cur.namespace(), cur.name())
                        .await?
                        .ok_or_else(|| StoreError::NotFound(cur.key().to_string()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApplyError::ConflictRetriesExhausted { key: start.key().to_string(), attempts: self.max_attempts })
    }
}

/// Server-assigned identity is not ours to send on create.
fn for_create(desired: &Object) -> Object {
    let mut o = desired.clone();
    o.meta.uid = None;
    o.meta.resource_version = None;
    o.meta.generation = None;
    o.meta.creation_timestamp = None;
    o.meta.deletion_timestamp = None;
    o.body.remove("status");
    o
}

/// A live object keeps at most one controller: refuse to lay a different
/// controller reference over it.
fn check_controller(live: &Object, desired: &Object) -> Result<(), OwnerError> {
    let (Some(want), Some(have)) = (desired.meta.controller_ref(), live.meta.controller_ref()) else {
        return Ok(());
    };
    if want.uid == have.uid {
        return Ok(());
    }
    Err(OwnerError::AlreadyOwned { object: live.key().to_string(), kind: have.kind.clone(), name: have.name.clone() })
}

/// Live object with the desired object's fields laid over it. Maps merge
/// recursively, equal-length arrays merge element-wise, everything else is
/// replaced. The result carries the live resourceVersion.
pub fn overlay(live: &Object, desired: &Object) -> Object {
    let mut next = live.clone();
    for (k, v) in desired.desired_body() {
        match next.body.get_mut(&k) {
            Some(cur) => merge_json(cur, &v),
            None => {
                next.body.insert(k, v);
            }
        }
    }
    let meta = &mut next.meta;
    meta.labels.extend(desired.meta.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    meta.annotations.extend(desired.meta.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    for r in &desired.meta.owner_references {
        match meta.owner_references.iter_mut().find(|x| x.uid == r.uid) {
            Some(x) => *x = r.clone(),
            None => meta.owner_references.push(r.clone()),
        }
    }
    for f in &desired.meta.finalizers {
        if !meta.has_finalizer(f) {
            meta.finalizers.push(f.clone());
        }
    }
    next
}

fn merge_json(cur: &mut Json, want: &Json) {
    match (cur, want) {
        (Json::Object(c), Json::Object(w)) => merge_map(c, w),
        (Json::Array(c), Json::Array(w)) if c.len() == w.len() => {
            for (cv, wv) in c.iter_mut().zip(w.iter()) {
                merge_json(cv, wv);
            }
        }
        (c, w) => {
            if c != w {
                *c = w.clone();
            }
        }
    }
}

fn merge_map(cur: &mut Map<String, Json>, want: &Map<String, Json>) {
    for (k, wv) in want {
        match cur.get_mut(k) {
            Some(cv) => merge_json(cv, wv),
            None => {
                cur.insert(k.clone(), wv.clone());
            }
        }
    }
}

/// Drop server-populated fields before diffing.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for noisy in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(noisy);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count leaf-level differences of `target` relative to `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (Json::Object(ao), Json::Null) => s.adds += ao.len(),
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
