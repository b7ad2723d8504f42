#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_core::{EventStream, Gvk, Meta, Object, ObjectList, ObjectStore, ResourceKey, Selector, StoreError, StoreResult};
use keel_runtime::backoff::ExponentialFailure;
use keel_runtime::watch::{Mapper, Multiplexer, Source, WatchSettings};
use keel_runtime::WorkQueue;
use keel_store::MemoryStore;
use tokio_util::sync::CancellationToken;

fn svc() -> Gvk { Gvk::new("admin.enmasse.io", "v1alpha1", "MessagingService") }
fn deploy() -> Gvk { Gvk::new("apps", "v1", "Deployment") }
fn cm() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

fn settings() -> WatchSettings {
    WatchSettings { resync: None, backoff_max: Duration::from_millis(50), failure_threshold: 3 }
}

fn new_queue() -> Arc<WorkQueue<ResourceKey>> {
    Arc::new(WorkQueue::new("test", Box::new(ExponentialFailure::new(Duration::from_millis(1), Duration::from_millis(10)))))
}

async fn next_key(q: &WorkQueue<ResourceKey>) -> ResourceKey {
    let k = tokio::time::timeout(Duration::from_secs(5), q.get()).await.expect("no key enqueued").expect("queue shut down");
    q.done(&k);
    k
}

fn owned_by_foo(owner: &Object, name: &str) -> Object {
    let mut d = Object::new(deploy(), Meta::named(Some("ns"), name));
    d.body.insert("spec".into(), serde_json::json!({ "replicas": 1 }));
    d.set_controller_owner(owner).unwrap();
    d
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secondary_events_enqueue_the_owner() {
    let store = Arc::new(MemoryStore::without_gc());
    let owner = store.create(&Object::new(svc(), Meta::named(Some("ns"), "foo"))).await.unwrap();
    let q = new_queue();
    let stop = CancellationToken::new();
    let source = Source::new(deploy(), Mapper::ControllerOwner { owner: svc(), namespaced: true });
    let mux = Multiplexer::new("test", source, store.clone(), q.clone(), settings());
    let task = tokio::spawn(mux.run(stop.clone()));

    let created = store.create(&owned_by_foo(&owner, "foo-deploy")).await.unwrap();
    assert_eq!(next_key(&q).await, ResourceKey::new(svc(), Some("ns"), "foo"));

    let mut edit = created.clone();
    edit.body.insert("spec".into(), serde_json::json!({ "replicas": 3 }));
    store.update(&edit).await.unwrap();
    assert_eq!(next_key(&q).await, ResourceKey::new(svc(), Some("ns"), "foo"));

    // no controller reference: dropped
    store.create(&Object::new(deploy(), Meta::named(Some("ns"), "stray"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(q.is_empty());

    stop.cancel();
    task.await.unwrap();
}

/// Delegates to a `MemoryStore`; the first watch after `expire_next` is armed
/// deletes `victim` behind the watcher's back and reports the position expired.
struct Expiring {
    inner: MemoryStore,
    expire_next: AtomicBool,
    victim: String,
}

#[async_trait::async_trait]
impl ObjectStore for Expiring {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<Option<Object>> {
        self.inner.get(gvk, namespace, name).await
    }
    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector) -> StoreResult<ObjectList> {
        self.inner.list(gvk, namespace, selector).await
    }
    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector, rv: &str) -> StoreResult<EventStream> {
        if self.expire_next.swap(false, Ordering::SeqCst) {
            self.inner.delete(&cm(), Some("ns"), &self.victim).await?;
            return Err(StoreError::Gone(format!("rv {} compacted", rv)));
        }
        self.inner.watch(gvk, namespace, selector, rv).await
    }
    async fn create(&self, obj: &Object) -> StoreResult<Object> { self.inner.create(obj).await }
    async fn update(&self, obj: &Object) -> StoreResult<Object> { self.inner.update(obj).await }
    async fn update_status(&self, obj: &Object) -> StoreResult<Object> { self.inner.update_status(obj).await }
    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        self.inner.delete(gvk, namespace, name).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_position_relists_and_sweeps_every_key() {
    let store = Arc::new(Expiring { inner: MemoryStore::new(), expire_next: AtomicBool::new(false), victim: "a".into() });
    for n in ["a", "b"] {
        store.create(&Object::new(cm(), Meta::named(Some("ns"), n))).await.unwrap();
    }
    let q = new_queue();
    let stop = CancellationToken::new();
    let mux = Multiplexer::new("test", Source::new(cm(), Mapper::Primary), store.clone(), q.clone(), settings());
    let task = tokio::spawn(mux.run(stop.clone()));

    let mut first = vec![next_key(&q).await.name, next_key(&q).await.name];
    first.sort();
    assert_eq!(first, vec!["a", "b"]);

    store.expire_next.store(true, Ordering::SeqCst);
    store.inner.disconnect_watches();

    // "a" vanished unseen, "b" never changed: both come back from the sweep
    let mut swept = vec![next_key(&q).await.name, next_key(&q).await.name];
    swept.sort();
    assert_eq!(swept, vec!["a", "b"]);
    assert!(store.get(&cm(), Some("ns"), "a").await.unwrap().is_none());

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_resync_reenqueues_known_keys() {
    let store = Arc::new(MemoryStore::new());
    store.create(&Object::new(cm(), Meta::named(Some("ns"), "a"))).await.unwrap();
    let q = new_queue();
    let stop = CancellationToken::new();
    let mut s = settings();
    s.resync = Some(Duration::from_millis(100));
    let task = tokio::spawn(Multiplexer::new("test", Source::new(cm(), Mapper::Primary), store.clone(), q.clone(), s).run(stop.clone()));

    assert_eq!(next_key(&q).await.name, "a");
    // no writes; the resync tick alone brings it back
    assert_eq!(next_key(&q).await.name, "a");

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn namespace_and_selector_scope_the_source() {
    let store = Arc::new(MemoryStore::new());
    let q = new_queue();
    let stop = CancellationToken::new();
    let mut source = Source::new(cm(), Mapper::Primary);
    source.namespace = Some("ns1".into());
    source.selector = Selector::default().with("app", "keel");
    let task = tokio::spawn(Multiplexer::new("test", source, store.clone(), q.clone(), settings()).run(stop.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let labelled = |ns: &str, name: &str| {
        let mut o = Object::new(cm(), Meta::named(Some(ns), name));
        o.meta.labels.insert("app".into(), "keel".into());
        o
    };
    store.create(&labelled("ns2", "elsewhere")).await.unwrap();
    store.create(&Object::new(cm(), Meta::named(Some("ns1"), "unlabelled"))).await.unwrap();
    store.create(&labelled("ns1", "wanted")).await.unwrap();
    assert_eq!(next_key(&q).await, ResourceKey::new(cm(), Some("ns1"), "wanted"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(q.is_empty());

    stop.cancel();
    task.await.unwrap();
}

/// Counts lists and watch calls. Watch calls wait on `gate`, so a test can
/// hold the watcher disconnected; with `closed` set every stream ends at once.
struct Counting {
    inner: MemoryStore,
    lists: AtomicU32,
    watches: AtomicU32,
    gate: tokio::sync::Mutex<()>,
    closed: bool,
}

impl Counting {
    fn new(closed: bool) -> Self {
        Self { inner: MemoryStore::new(), lists: AtomicU32::new(0), watches: AtomicU32::new(0), gate: tokio::sync::Mutex::new(()), closed }
    }
}

#[async_trait::async_trait]
impl ObjectStore for Counting {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<Option<Object>> {
        self.inner.get(gvk, namespace, name).await
    }
    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector) -> StoreResult<ObjectList> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list(gvk, namespace, selector).await
    }
    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector, rv: &str) -> StoreResult<EventStream> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        let _open = self.gate.lock().await;
        if self.closed {
            return Ok(Box::pin(futures::stream::empty()));
        }
        self.inner.watch(gvk, namespace, selector, rv).await
    }
    async fn create(&self, obj: &Object) -> StoreResult<Object> { self.inner.create(obj).await }
    async fn update(&self, obj: &Object) -> StoreResult<Object> { self.inner.update(obj).await }
    async fn update_status(&self, obj: &Object) -> StoreResult<Object> { self.inner.update_status(obj).await }
    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        self.inner.delete(gvk, namespace, name).await
    }
}

async fn until(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_stream_resumes_without_relisting() {
    let store = Arc::new(Counting::new(false));
    store.create(&Object::new(cm(), Meta::named(Some("ns"), "a"))).await.unwrap();
    let q = new_queue();
    let stop = CancellationToken::new();
    let task = tokio::spawn(Multiplexer::new("test", Source::new(cm(), Mapper::Primary), store.clone(), q.clone(), settings()).run(stop.clone()));

    assert_eq!(next_key(&q).await.name, "a");
    until(|| store.watches.load(Ordering::SeqCst) == 1).await;

    // Hold the watcher off while "b" is written; it must replay from its last position.
    let held = store.gate.lock().await;
    store.inner.disconnect_watches();
    until(|| store.watches.load(Ordering::SeqCst) == 2).await;
    store.create(&Object::new(cm(), Meta::named(Some("ns"), "b"))).await.unwrap();
    drop(held);

    assert_eq!(next_key(&q).await.name, "b");
    assert_eq!(store.lists.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(q.is_empty());

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cleanly_closing_streams_are_not_resubscribed_in_a_loop() {
    let store = Arc::new(Counting::new(true));
    let q = new_queue();
    let stop = CancellationToken::new();
    let mut s = settings();
    s.backoff_max = Duration::from_secs(1);
    let task = tokio::spawn(Multiplexer::new("test", Source::new(cm(), Mapper::Primary), store.clone(), q.clone(), s).run(stop.clone()));

    tokio::time::sleep(Duration::from_millis(1050)).await;
    let watches = store.watches.load(Ordering::SeqCst);
    assert!((5..=12).contains(&watches), "watches={}", watches);
    assert_eq!(store.lists.load(Ordering::SeqCst), 1);

    stop.cancel();
    task.await.unwrap();
}
