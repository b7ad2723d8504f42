//! Keel core types: kinds, keys, objects, owner references and the store contract.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod object;
mod registry;
mod store;

pub use error::{CodecError, OwnerError, ReconcileError, StoreError, StoreResult};
pub use object::{Meta, Object, OwnerRef, TypedObject};
pub use registry::{KindInfo, Registry};
pub use store::{EventStream, ObjectList, ObjectStore, WatchEvent};

pub mod prelude {
    pub use super::{
        Action, Gvk, Meta, Object, ObjectStore, OwnerRef, ReconcileError, Registry, Request, ResourceKey, Selector,
        StoreError, TypedObject, WatchEvent,
    };
}

/// Group/Version/Kind of a resource. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` (`v1` or `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self::new(group, version, kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse(key: &str) -> Result<Self, CodecError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(CodecError::Invalid(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    /// Same group and kind, any version. Owner references are matched this way.
    pub fn same_group_kind(&self, other: &Gvk) -> bool {
        self.group == other.group && self.kind == other.kind
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Identity of one reconcilable object: `(kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// Equality-based label selector. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub match_labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn everything() -> Self { Self::default() }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.match_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool { self.match_labels.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as `k1=v1,k2=v2` for the API server.
    pub fn to_query(&self) -> String {
        self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

/// A reconciliation request. Carries only the key, never a snapshot of the object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub key: ResourceKey,
}

impl Request {
    pub fn new(key: ResourceKey) -> Self { Self { key } }
}

/// Successful reconcile outcomes. Failures are `Err(ReconcileError)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged for now; forget the key.
    Done,
    /// More work remains; re-add without growing the backoff.
    Requeue,
    /// Re-add after a fixed delay; resets the attempt counter.
    RequeueAfter(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_roundtrip_core_and_grouped() {
        let core = Gvk::parse("v1/ConfigMap").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.key(), "v1/ConfigMap");

        let apps = Gvk::parse("apps/v1/Deployment").unwrap();
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(Gvk::from_api_version("apps/v1", "Deployment"), apps);

        let e = Gvk::parse("Deployment").unwrap_err().to_string();
        assert!(e.contains("invalid gvk key"), "e={}", e);
    }

    #[test]
    fn same_group_kind_ignores_version() {
        let a = Gvk::new("admin.enmasse.io", "v1alpha1", "MessagingService");
        let b = Gvk::new("admin.enmasse.io", "v1beta1", "MessagingService");
        assert!(a.same_group_kind(&b));
        assert!(!a.same_group_kind(&Gvk::new("", "v1", "MessagingService")));
    }

    #[test]
    fn selector_matches_subset() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "example".to_string());
        labels.insert("tier".to_string(), "broker".to_string());
        assert!(Selector::everything().matches(&labels));
        assert!(Selector::default().with("app", "example").matches(&labels));
        assert!(!Selector::default().with("app", "other").matches(&labels));
        assert_eq!(Selector::default().with("a", "1").with("b", "2").to_query(), "a=1,b=2");
    }

    #[test]
    fn resource_key_display() {
        let k = ResourceKey::new(Gvk::new("apps", "v1", "Deployment"), Some("ns1"), "example-deploy");
        assert_eq!(k.to_string(), "apps/v1/Deployment ns1/example-deploy");
    }
}
