//! Keel kubehub: the `ObjectStore` contract over a real API server, and discovery.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use keel_core::{
    EventStream, Gvk, Object, ObjectList, ObjectStore, Registry, Selector, StoreError, StoreResult, WatchEvent,
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide client from the ambient kubeconfig or in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let c = CLIENT.get_or_try_init(|| async { Client::try_default().await }).await?;
    Ok(c.clone())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> Gvk { Gvk::new(&self.group, &self.version, &self.kind) }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Registered kinds absent from `served`.
pub fn missing_kinds(served: &[DiscoveredResource], registry: &Registry) -> Vec<Gvk> {
    let mut missing: Vec<Gvk> =
        registry.kinds().map(|k| k.gvk.clone()).filter(|g| !served.iter().any(|d| &d.gvk() == g)).collect();
    missing.sort();
    missing
}

fn map_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(r) => {
            let msg = format!("{} ({})", r.message, r.reason);
            match (r.code, r.reason.as_str()) {
                (404, _) => StoreError::NotFound(msg),
                (409, "AlreadyExists") => StoreError::AlreadyExists(msg),
                (409, _) => StoreError::Conflict(msg),
                (410, _) => StoreError::Gone(msg),
                (400, _) | (422, _) => StoreError::Invalid(msg),
                _ => StoreError::Transient(msg),
            }
        }
        other => StoreError::Transient(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn from_dynamic(obj: &DynamicObject, gvk: &Gvk) -> StoreResult<Object> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
    strip_managed_fields(&mut raw);
    // List items arrive without apiVersion/kind.
    Object::from_parts(gvk.clone(), raw).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn to_dynamic(obj: &Object) -> StoreResult<DynamicObject> {
    serde_json::from_value(obj.to_json()).map_err(|e| StoreError::Invalid(format!("{}: {}", obj.key(), e)))
}

/// `ObjectStore` backed by the API server. Kinds resolve through the registry
/// first and fall back to discovery.
pub struct KubeStore {
    client: Client,
    registry: Arc<Registry>,
    discovered: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client, registry: Arc<Registry>) -> Self {
        Self { client, registry, discovered: Mutex::new(FxHashMap::default()) }
    }

    async fn resource(&self, gvk: &Gvk) -> StoreResult<(ApiResource, bool)> {
        let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        if let Some(info) = self.registry.get(gvk) {
            return Ok((ApiResource::from_gvk_with_plural(&kgvk, &info.plural), info.namespaced));
        }
        if let Some(hit) = self.discovered.lock().unwrap_or_else(|e| e.into_inner()).get(gvk) {
            return Ok(hit.clone());
        }
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(map_err)?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == kgvk.group && ar.version == kgvk.version && ar.kind == kgvk.kind {
                    let hit = (ar.clone(), matches!(caps.scope, Scope::Namespaced));
                    debug!(gvk = %gvk, plural = %ar.plural, "resolved kind via discovery");
                    self.discovered.lock().unwrap_or_else(|e| e.into_inner()).insert(gvk.clone(), hit.clone());
                    return Ok(hit);
                }
            }
        }
        Err(StoreError::UnknownKind(gvk.key()))
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.resource(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<Option<Object>> {
        let api = self.api(gvk, namespace).await?;
        match api.get_opt(name).await.map_err(map_err)? {
            Some(o) => Ok(Some(from_dynamic(&o, gvk)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector) -> StoreResult<ObjectList> {
        let api = self.api(gvk, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_query());
        }
        let list = api.list(&lp).await.map_err(map_err)?;
        let items = list.items.iter().map(|o| from_dynamic(o, gvk)).collect::<StoreResult<Vec<_>>>()?;
        Ok(ObjectList { items, resource_version: list.metadata.resource_version.unwrap_or_default() })
    }

    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector, resource_version: &str) -> StoreResult<EventStream> {
        let api = self.api(gvk, namespace).await?;
        let mut wp = WatchParams::default().timeout(290);
        if !selector.is_empty() {
            wp = wp.labels(&selector.to_query());
        }
        let rv = if resource_version.is_empty() { "0" } else { resource_version };
        let stream = api.watch(&wp, rv).await.map_err(map_err)?;
        info!(gvk = %gvk, ns = ?namespace, rv = %rv, "watch opened");
        let gvk = gvk.clone();
        let events = stream.map_err(map_err).map(move |item| {
            let ev = match item? {
                KubeEvent::Added(o) => WatchEvent::Added(from_dynamic(&o, &gvk)?),
                KubeEvent::Modified(o) => WatchEvent::Modified(from_dynamic(&o, &gvk)?),
                KubeEvent::Deleted(o) => WatchEvent::Deleted(from_dynamic(&o, &gvk)?),
                KubeEvent::Bookmark(b) => WatchEvent::Bookmark(b.metadata.resource_version),
                KubeEvent::Error(r) => {
                    counter!("kube_watch_errors_total", 1u64);
                    return Err(map_err(kube::Error::Api(r)));
                }
            };
            Ok(ev)
        });
        Ok(events.boxed())
    }

    async fn create(&self, obj: &Object) -> StoreResult<Object> {
        let api = self.api(&obj.gvk, obj.namespace()).await?;
        let created = api.create(&PostParams::default(), &to_dynamic(obj)?).await.map_err(map_err)?;
        from_dynamic(&created, &obj.gvk)
    }

    async fn update(&self, obj: &Object) -> StoreResult<Object> {
        let api = self.api(&obj.gvk, obj.namespace()).await?;
        let mut body = obj.clone();
        // The main resource ignores status on PUT; omit it to keep requests small.
        body.body.remove("status");
        let updated = api.replace(obj.name(), &PostParams::default(), &to_dynamic(&body)?).await.map_err(map_err)?;
        from_dynamic(&updated, &obj.gvk)
    }

    async fn update_status(&self, obj: &Object) -> StoreResult<Object> {
        let api = self.api(&obj.gvk, obj.namespace()).await?;
        let data = serde_json::to_vec(&obj.to_json()).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let updated = api.replace_status(obj.name(), &PostParams::default(), data).await.map_err(map_err)?;
        from_dynamic(&updated, &obj.gvk)
    }

    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        let api = self.api(gvk, namespace).await?;
        api.delete(name, &DeleteParams::background()).await.map_err(map_err)?;
        Ok(())
    }
}
