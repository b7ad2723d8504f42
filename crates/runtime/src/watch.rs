//! Watch multiplexer: list+watch one source kind and turn events into
//! reconciliation keys on the controller's queue.
//!
//! Resumes from the last seen resourceVersion after a dropped stream. When that
//! position has expired (`Gone`) it re-lists and enqueues every known key once,
//! including keys of objects that vanished while it was not watching.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use keel_core::{Gvk, Object, ObjectStore, ResourceKey, Selector, StoreError, WatchEvent};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::owner::controller_owner_key;
use crate::queue::WorkQueue;

/// Least wait before resubscribing after a stream closed cleanly.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

pub type Keys = SmallVec<[ResourceKey; 1]>;
pub type MapFn = Arc<dyn Fn(&Object) -> Keys + Send + Sync>;

/// How an event on a source object becomes reconciliation keys.
#[derive(Clone)]
pub enum Mapper {
    /// The object is the primary; its own key.
    Primary,
    /// The controller owner's key, if the controller is of kind `owner`.
    ControllerOwner { owner: Gvk, namespaced: bool },
    Custom(MapFn),
}

impl Mapper {
    pub fn keys(&self, obj: &Object) -> Keys {
        match self {
            Mapper::Primary => smallvec![obj.key()],
            Mapper::ControllerOwner { owner, namespaced } => controller_owner_key(obj, owner, *namespaced).into_iter().collect(),
            Mapper::Custom(f) => f(obj),
        }
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mapper::Primary => f.write_str("Primary"),
            Mapper::ControllerOwner { owner, .. } => write!(f, "ControllerOwner({})", owner),
            Mapper::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub selector: Selector,
    pub mapper: Mapper,
}

impl Source {
    pub fn new(gvk: Gvk, mapper: Mapper) -> Self {
        Self { gvk, namespace: None, selector: Selector::everything(), mapper }
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub resync: Option<Duration>,
    pub backoff_max: Duration,
    pub failure_threshold: u32,
}

pub struct Multiplexer {
    controller: String,
    source: Source,
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<ResourceKey>>,
    settings: WatchSettings,
    /// Last seen state of every object in scope, for resync sweeps.
    known: FxHashMap<ResourceKey, Object>,
    failures: u32,
    disconnected: bool,
}

enum StreamEnd {
    Cancelled,
    /// Resume position expired; re-list.
    Expired,
    /// Stream closed or failed; resume from the last position.
    Closed,
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

impl Multiplexer {
    pub fn new(controller: &str, source: Source, store: Arc<dyn ObjectStore>, queue: Arc<WorkQueue<ResourceKey>>, settings: WatchSettings) -> Self {
        Self {
            controller: controller.to_string(),
            source,
            store,
            queue,
            settings,
            known: FxHashMap::default(),
            failures: 0,
            disconnected: false,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let gvk = self.source.gvk.clone();
        info!(controller = %self.controller, gvk = %gvk, ns = ?self.source.namespace, mapper = ?self.source.mapper, "watch started");
        let mut resync = self.settings.resync.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        let mut resume: Option<String> = None;
        while !shutdown.is_cancelled() {
            let rv = match resume.take() {
                Some(rv) => rv,
                None => match self.relist().await {
                    Ok(rv) => rv,
                    Err(e) => {
                        self.failed(&e);
                        if self.pause(&shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };
            let stream = match self.store.watch(&gvk, self.source.namespace.as_deref(), &self.source.selector, &rv).await {
                Ok(s) => s,
                Err(e) if e.is_gone() => {
                    debug!(controller = %self.controller, gvk = %gvk, rv = %rv, "resume position expired; re-listing");
                    continue;
                }
                Err(e) => {
                    self.failed(&e);
                    resume = Some(rv);
                    if self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            let mut rv = rv;
            match self.follow(stream, &mut rv, &mut resync, &shutdown).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Expired => {
                    counter!("watch_restarts_total", 1u64, "gvk" => gvk.key(), "reason" => "expired");
                }
                StreamEnd::Closed => {
                    counter!("watch_restarts_total", 1u64, "gvk" => gvk.key(), "reason" => "closed");
                    resume = Some(rv);
                    let delay = if self.failures > 0 { self.backoff() } else { RESUBSCRIBE_DELAY.min(self.settings.backoff_max) };
                    if sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }
        info!(controller = %self.controller, gvk = %gvk, "watch stopped");
    }

    async fn follow(
        &mut self,
        mut stream: keel_core::EventStream,
        rv: &mut String,
        resync: &mut Option<Interval>,
        shutdown: &CancellationToken,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return StreamEnd::Cancelled,
                _ = tick(resync) => self.sweep_known("periodic"),
                item = stream.next() => match item {
                    Some(Ok(ev)) => {
                        self.recovered();
                        if let Some(v) = ev.resource_version() {
                            *rv = v.to_string();
                        }
                        self.handle(ev);
                    }
                    Some(Err(e)) if e.is_gone() => return StreamEnd::Expired,
                    Some(Err(e)) => {
                        self.failed(&e);
                        return StreamEnd::Closed;
                    }
                    None => {
                        debug!(controller = %self.controller, gvk = %self.source.gvk, "watch stream ended; resubscribing");
                        return StreamEnd::Closed;
                    }
                }
            }
        }
    }

    /// Full list: replace the known set and enqueue every key once, plus keys
    /// of objects that disappeared since the last list.
    async fn relist(&mut self) -> Result<String, StoreError> {
        let t0 = std::time::Instant::now();
        let list = self.store.list(&self.source.gvk, self.source.namespace.as_deref(), &self.source.selector).await?;
        self.recovered();
        let fresh: FxHashMap<ResourceKey, Object> = list.items.into_iter().map(|o| (o.key(), o)).collect();
        let mut vanished = 0usize;
        for (k, gone) in self.known.iter() {
            if !fresh.contains_key(k) {
                vanished += 1;
                self.enqueue(gone);
            }
        }
        self.known = fresh;
        self.sweep_known("relist");
        info!(
            controller = %self.controller,
            gvk = %self.source.gvk,
            count = self.known.len(),
            vanished,
            took_ms = %t0.elapsed().as_millis(),
            "listed"
        );
        Ok(list.resource_version)
    }

    fn sweep_known(&self, reason: &'static str) {
        for obj in self.known.values() {
            self.enqueue(obj);
        }
        counter!("resync_sweeps_total", 1u64, "gvk" => self.source.gvk.key(), "reason" => reason);
    }

    fn handle(&mut self, ev: WatchEvent) {
        match ev {
            WatchEvent::Added(o) | WatchEvent::Modified(o) => {
                // An owner change must also wake the previous owner.
                if let Some(prev) = self.known.insert(o.key(), o.clone()) {
                    if prev.meta.owner_references != o.meta.owner_references {
                        self.enqueue(&prev);
                    }
                }
                self.enqueue(&o);
            }
            WatchEvent::Deleted(o) => {
                self.known.remove(&o.key());
                self.enqueue(&o);
            }
            WatchEvent::Bookmark(_) => {}
        }
    }

    fn enqueue(&self, obj: &Object) {
        for key in self.source.mapper.keys(obj) {
            debug!(controller = %self.controller, key = %key, from = %obj.key(), "enqueue");
            self.queue.add(key);
        }
    }

    fn failed(&mut self, e: &StoreError) {
        self.failures += 1;
        counter!("watch_errors_total", 1u64, "gvk" => self.source.gvk.key());
        if self.failures >= self.settings.failure_threshold.max(1) && !self.disconnected {
            self.disconnected = true;
            gauge!("watch_disconnected", 1.0, "controller" => self.controller.clone(), "gvk" => self.source.gvk.key());
            error!(
                controller = %self.controller,
                gvk = %self.source.gvk,
                failures = self.failures,
                error = %e,
                "lost connectivity to object store; still retrying"
            );
        } else {
            warn!(controller = %self.controller, gvk = %self.source.gvk, failures = self.failures, error = %e, "watch failed");
        }
    }

    fn recovered(&mut self) {
        self.failures = 0;
        if self.disconnected {
            self.disconnected = false;
            gauge!("watch_disconnected", 0.0, "controller" => self.controller.clone(), "gvk" => self.source.gvk.key());
            info!(controller = %self.controller, gvk = %self.source.gvk, "object store connectivity restored");
        }
    }

    /// Capped exponential backoff for the current failure streak.
    fn backoff(&self) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        Duration::from_millis(100u64 << exp).min(self.settings.backoff_max)
    }

    /// Back off before a retry. Returns true if cancelled meanwhile.
    async fn pause(&self, shutdown: &CancellationToken) -> bool { sleep_or_cancel(self.backoff(), shutdown).await }
}

async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Meta, OwnerRef};

    #[test]
    fn custom_mapper_fans_out() {
        let target = Gvk::new("admin.enmasse.io", "v1alpha1", "MessagingService");
        let m = Mapper::Custom(Arc::new(move |o: &Object| -> Keys {
            o.meta
                .annotations
                .get("keel.io/used-by")
                .map(|v| v.split(',').map(|n| ResourceKey::new(target.clone(), o.namespace(), n)).collect())
                .unwrap_or_default()
        }));
        let mut meta = Meta::named(Some("ns"), "shared-secret");
        meta.annotations.insert("keel.io/used-by".into(), "a,b".into());
        let keys = m.keys(&Object::new(Gvk::new("", "v1", "Secret"), meta));
        let names: Vec<_> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn primary_and_owner_mappers() {
        let svc = Gvk::new("admin.enmasse.io", "v1alpha1", "MessagingService");
        let mut meta = Meta::named(Some("ns"), "foo-deploy");
        meta.owner_references.push(OwnerRef {
            api_version: svc.api_version(),
            kind: svc.kind.clone(),
            name: "foo".into(),
            uid: "u".into(),
            controller: Some(true),
            block_owner_deletion: None,
        });
        let d = Object::new(Gvk::new("apps", "v1", "Deployment"), meta);
        assert_eq!(Mapper::Primary.keys(&d)[0], d.key());
        let owner = Mapper::ControllerOwner { owner: svc.clone(), namespaced: true }.keys(&d);
        assert_eq!(owner.as_slice(), &[ResourceKey::new(svc, Some("ns"), "foo")]);
    }
}
