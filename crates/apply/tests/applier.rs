#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use keel_apply::{ApplyError, ApplyOutcome, Applier};
use keel_core::{EventStream, Gvk, Meta, Object, ObjectList, ObjectStore, OwnerError, Registry, Selector, StoreError, StoreResult};
use keel_store::MemoryStore;
use tokio::sync::Barrier;

fn cm_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

fn cm(data: &str) -> Object {
    let mut o = Object::new(cm_gvk(), Meta::named(Some("ns1"), "settings"));
    o.body.insert("data".into(), serde_json::json!({ "mode": data }));
    o
}

/// Fails the first `conflicts` updates with `Conflict`; gets block on a
/// barrier until `racers` callers have arrived.
struct Faulty {
    inner: MemoryStore,
    conflicts: AtomicU32,
    racers: AtomicU32,
    barrier: Barrier,
}

impl Faulty {
    fn new(conflicts: u32, racers: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(conflicts),
            racers: AtomicU32::new(racers),
            barrier: Barrier::new(racers.max(1) as usize),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for Faulty {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<Option<Object>> {
        let res = self.inner.get(gvk, namespace, name).await;
        if self.racers.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            self.barrier.wait().await;
        }
        res
    }
    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector) -> StoreResult<ObjectList> {
        self.inner.list(gvk, namespace, selector).await
    }
    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector, rv: &str) -> StoreResult<EventStream> {
        self.inner.watch(gvk, namespace, selector, rv).await
    }
    async fn create(&self, obj: &Object) -> StoreResult<Object> { self.inner.create(obj).await }
    async fn update(&self, obj: &Object) -> StoreResult<Object> {
        if self.conflicts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(StoreError::Conflict(obj.key().to_string()));
        }
        self.inner.update(obj).await
    }
    async fn update_status(&self, obj: &Object) -> StoreResult<Object> {
        if self.conflicts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(StoreError::Conflict(obj.key().to_string()));
        }
        self.inner.update_status(obj).await
    }
    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        self.inner.delete(gvk, namespace, name).await
    }
}

fn applier(store: Arc<Faulty>, max_attempts: u32) -> Applier {
    Applier::new(store, Arc::new(Registry::with_builtins())).with_max_attempts(max_attempts)
}

#[tokio::test]
async fn create_then_noop_then_update() {
    let store = Arc::new(Faulty::new(0, 0));
    let a = applier(store.clone(), 5);

    let r1 = a.apply(&cm("on")).await.unwrap();
    assert_eq!(r1.outcome, ApplyOutcome::Created);
    let r2 = a.apply(&cm("on")).await.unwrap();
    assert_eq!(r2.outcome, ApplyOutcome::Unchanged);
    assert_eq!(r2.new_rv(), r1.new_rv());
    let r3 = a.apply(&cm("off")).await.unwrap();
    assert_eq!(r3.outcome, ApplyOutcome::Updated);
    assert_eq!(r3.summary.updates, 1);

    let stats = store.inner.stats();
    assert_eq!((stats.creates, stats.updates), (1, 1));
}

#[tokio::test]
async fn conflicts_below_the_ceiling_converge() {
    for n in 0..4u32 {
        let store = Arc::new(Faulty::new(0, 0));
        let a = applier(store.clone(), 5);
        a.apply(&cm("v1")).await.unwrap();
        store.conflicts.store(n, Ordering::SeqCst);

        let r = a.apply(&cm("v2")).await.unwrap();
        assert_eq!(r.outcome, ApplyOutcome::Updated);
        assert_eq!(r.attempts, n + 1);
        let live = store.inner.get(&cm_gvk(), Some("ns1"), "settings").await.unwrap().unwrap();
        assert_eq!(live.body["data"]["mode"], "v2");
    }
}

#[tokio::test]
async fn conflicts_at_the_ceiling_surface() {
    for n in [5u32, 9] {
        let store = Arc::new(Faulty::new(0, 0));
        let a = applier(store.clone(), 5);
        a.apply(&cm("v1")).await.unwrap();
        store.conflicts.store(n, Ordering::SeqCst);

        let err = a.apply(&cm("v2")).await.unwrap_err();
        assert!(matches!(err, ApplyError::ConflictRetriesExhausted { attempts: 5, .. }), "err={}", err);
        let live = store.inner.get(&cm_gvk(), Some("ns1"), "settings").await.unwrap().unwrap();
        assert_eq!(live.body["data"]["mode"], "v1");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_creates_produce_one_object() {
    let store = Arc::new(Faulty::new(0, 2));
    let a = applier(store.clone(), 5);
    let (o1, o2) = (cm("on"), cm("on"));
    let (r1, r2) = tokio::join!(a.apply(&o1), a.apply(&o2));
    let mut outcomes = vec![r1.unwrap().outcome, r2.unwrap().outcome];
    outcomes.sort_by_key(|o| format!("{:?}", o));
    assert_eq!(outcomes, vec![ApplyOutcome::Created, ApplyOutcome::Unchanged]);
    assert_eq!(store.inner.stats().creates, 1);
}

#[tokio::test]
async fn invalid_objects_are_rejected_before_writing() {
    let store = Arc::new(Faulty::new(0, 0));
    let a = applier(store.clone(), 5);
    let cluster_scoped_in_ns = Object::new(Gvk::new("", "v1", "Namespace"), Meta::named(Some("ns1"), "x"));
    assert!(matches!(a.apply(&cluster_scoped_in_ns).await, Err(ApplyError::Invalid(_))));
    let unknown = Object::new(Gvk::new("x.io", "v1", "Thing"), Meta::named(Some("ns1"), "x"));
    assert!(matches!(a.apply(&unknown).await, Err(ApplyError::Store(StoreError::UnknownKind(_)))));
    assert_eq!(store.inner.stats().total(), 0);
}

#[tokio::test]
async fn status_writes_only_on_difference_and_retry_conflicts() {
    let store = Arc::new(Faulty::new(0, 0));
    let a = applier(store.clone(), 5);
    let live = a.apply(&cm("on")).await.unwrap().object;

    store.conflicts.store(2, Ordering::SeqCst);
    let st = serde_json::json!({ "messages": [] });
    let written = a.apply_status(&live, st.clone()).await.unwrap();
    assert_eq!(written.status(), Some(&st));
    assert_eq!(store.inner.stats().status_updates, 1);

    a.apply_status(&written, st).await.unwrap();
    assert_eq!(store.inner.stats().status_updates, 1);
}

#[tokio::test]
async fn prune_and_sweep_remove_only_owned_objects() {
    let store = Arc::new(Faulty::new(0, 0));
    let a = applier(store.clone(), 5);
    let owner = store.inner.create(&Object::new(Gvk::new("apps", "v1", "Deployment"), Meta::named(Some("ns1"), "owner"))).await.unwrap();

    for name in ["keep", "drop"] {
        let mut o = cm("x");
        o.meta.name = name.into();
        a.apply_owned(&owner, o).await.unwrap();
    }
    let mut foreign = cm("x");
    foreign.meta.name = "foreign".into();
    a.apply(&foreign).await.unwrap();

    assert_eq!(a.prune_owned(&owner, &cm_gvk(), &["keep"]).await.unwrap(), 1);
    let names: Vec<String> = store.inner.list(&cm_gvk(), Some("ns1"), &Selector::everything()).await.unwrap().items.iter().map(|o| o.name().to_string()).collect();
    assert_eq!(names, vec!["foreign".to_string(), "keep".to_string()]);

    assert_eq!(a.sweep_owned(&owner, &[cm_gvk()]).await.unwrap(), 1);
    assert!(store.inner.get(&cm_gvk(), Some("ns1"), "keep").await.unwrap().is_none());
    assert!(store.inner.get(&cm_gvk(), Some("ns1"), "foreign").await.unwrap().is_some());
}

#[tokio::test]
async fn finalizers_gate_deletion() {
    let store = Arc::new(Faulty::new(0, 0));
    let a = applier(store.clone(), 5);
    let live = a.apply(&cm("on")).await.unwrap().object;
    let held = a.ensure_finalizer(&live, "keel.io/cleanup").await.unwrap();
    let again = a.ensure_finalizer(&held, "keel.io/cleanup").await.unwrap();
    assert_eq!(again.resource_version(), held.resource_version());

    store.delete(&cm_gvk(), Some("ns1"), "settings").await.unwrap();
    let deleting = store.get(&cm_gvk(), Some("ns1"), "settings").await.unwrap().unwrap();
    assert!(deleting.meta.is_deleting());
    a.remove_finalizer(&deleting, "keel.io/cleanup").await.unwrap();
    assert!(store.get(&cm_gvk(), Some("ns1"), "settings").await.unwrap().is_none());
}

#[tokio::test]
async fn second_controller_is_refused_on_live_object() {
    let store = Arc::new(Faulty::new(0, 0));
    let a = applier(store.clone(), 5);
    let deploy = Gvk::new("apps", "v1", "Deployment");
    let first = store.inner.create(&Object::new(deploy.clone(), Meta::named(Some("ns1"), "first"))).await.unwrap();
    let second = store.inner.create(&Object::new(deploy, Meta::named(Some("ns1"), "second"))).await.unwrap();

    a.apply_owned(&first, cm("on")).await.unwrap();
    let again = a.apply_owned(&first, cm("on")).await.unwrap();
    assert_eq!(again.outcome, ApplyOutcome::Unchanged);

    let before = store.inner.stats().total();
    let err = a.apply_owned(&second, cm("off")).await.unwrap_err();
    assert!(matches!(err, ApplyError::Owner(OwnerError::AlreadyOwned { ref name, .. }) if name == "first"), "err={}", err);
    assert_eq!(store.inner.stats().total(), before);

    let live = store.inner.get(&cm_gvk(), Some("ns1"), "settings").await.unwrap().unwrap();
    let controllers: Vec<&str> = live.meta.owner_references.iter().filter(|r| r.controller == Some(true)).map(|r| r.uid.as_str()).collect();
    assert_eq!(controllers, vec![first.meta.uid.as_deref().unwrap()]);
    assert_eq!(live.body["data"]["mode"], "on");
}
