//! Loosely typed objects in the Kubernetes wire shape, plus the typed view.
//!
//! `Clone` is the deep-copy contract: every nested collection is owned, so a
//! clone can be mutated freely without touching what the store handed out.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{CodecError, Gvk, OwnerError, ResourceKey};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Optimistic-concurrency token. Opaque; compared for equality only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl Meta {
    pub fn named(namespace: Option<&str>, name: &str) -> Self {
        Self { name: name.to_string(), namespace: namespace.map(|s| s.to_string()), ..Default::default() }
    }

    /// The single owner reference marked `controller: true`, if any.
    pub fn controller_ref(&self) -> Option<&OwnerRef> {
        self.owner_references.iter().find(|r| r.controller == Some(true))
    }

    pub fn is_controlled_by(&self, owner_uid: &str) -> bool {
        self.controller_ref().map(|r| r.uid == owner_uid).unwrap_or(false)
    }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, f: &str) -> bool { self.finalizers.iter().any(|x| x == f) }
}

/// Back-pointer from a secondary object to the primary that created it.
/// The namespace is implied: owners live in the dependent's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerRef {
    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(&self.api_version, &self.kind) }
}

/// A versioned record: kind, metadata and the remaining body (`spec`, `status`, `data`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub gvk: Gvk,
    pub meta: Meta,
    pub body: Map<String, Json>,
}

impl Object {
    pub fn new(gvk: Gvk, meta: Meta) -> Self { Self { gvk, meta, body: Map::new() } }

    pub fn key(&self) -> ResourceKey {
        ResourceKey { gvk: self.gvk.clone(), namespace: self.meta.namespace.clone(), name: self.meta.name.clone() }
    }

    pub fn name(&self) -> &str { &self.meta.name }
    pub fn namespace(&self) -> Option<&str> { self.meta.namespace.as_deref() }
    pub fn resource_version(&self) -> Option<&str> { self.meta.resource_version.as_deref() }

    pub fn spec(&self) -> Option<&Json> { self.body.get("spec") }
    pub fn status(&self) -> Option<&Json> { self.body.get("status") }

    pub fn set_status(&mut self, status: Json) { self.body.insert("status".into(), status); }

    /// Body without `status`; the part a spec writer owns.
    pub fn desired_body(&self) -> Map<String, Json> {
        let mut b = self.body.clone();
        b.remove("status");
        b
    }

    /// Decode from the wire shape (`apiVersion`, `kind`, `metadata`, rest).
    pub fn from_json(v: Json) -> Result<Self, CodecError> {
        let mut map = match v {
            Json::Object(m) => m,
            _ => return Err(CodecError::Invalid("object must be a JSON map".into())),
        };
        let api_version = take_str(&mut map, "apiVersion")?;
        let kind = take_str(&mut map, "kind")?;
        Self::from_parts(Gvk::from_api_version(&api_version, &kind), Json::Object(map))
    }

    /// Decode a body whose kind is known out of band (typed objects omit apiVersion/kind).
    pub fn from_parts(gvk: Gvk, v: Json) -> Result<Self, CodecError> {
        let mut map = match v {
            Json::Object(m) => m,
            _ => return Err(CodecError::Invalid("object must be a JSON map".into())),
        };
        map.remove("apiVersion");
        map.remove("kind");
        let meta: Meta = match map.remove("metadata") {
            Some(m) => serde_json::from_value(m)?,
            None => return Err(CodecError::Invalid("missing metadata".into())),
        };
        if meta.name.is_empty() {
            return Err(CodecError::Invalid("missing metadata.name".into()));
        }
        Ok(Self { gvk, meta, body: map })
    }

    pub fn to_json(&self) -> Json {
        let mut map = Map::with_capacity(self.body.len() + 3);
        map.insert("apiVersion".into(), Json::String(self.gvk.api_version()));
        map.insert("kind".into(), Json::String(self.gvk.kind.clone()));
        map.insert("metadata".into(), serde_json::to_value(&self.meta).unwrap_or(Json::Null));
        for (k, v) in self.body.iter() {
            map.insert(k.clone(), v.clone());
        }
        Json::Object(map)
    }

    /// Reference to this object suitable for a dependent's `ownerReferences`.
    pub fn controller_ref_to(&self) -> Result<OwnerRef, OwnerError> {
        let uid = self.meta.uid.clone().ok_or_else(|| OwnerError::MissingUid(self.key().to_string()))?;
        Ok(OwnerRef {
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            name: self.meta.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Mark `owner` as this object's controller. Idempotent for the same owner;
    /// refuses to steal an object controlled by someone else.
    pub fn set_controller_owner(&mut self, owner: &Object) -> Result<(), OwnerError> {
        let r = owner.controller_ref_to()?;
        if owner.meta.namespace.is_some() && owner.meta.namespace != self.meta.namespace {
            return Err(OwnerError::CrossNamespace {
                object: self.key().to_string(),
                namespace: self.meta.namespace.clone(),
                owner: owner.key().to_string(),
            });
        }
        if let Some(existing) = self.meta.controller_ref() {
            if existing.uid != r.uid {
                return Err(OwnerError::AlreadyOwned {
                    object: self.key().to_string(),
                    kind: existing.kind.clone(),
                    name: existing.name.clone(),
                });
            }
        }
        self.meta.owner_references.retain(|x| x.uid != r.uid);
        self.meta.owner_references.push(r);
        Ok(())
    }
}

fn take_str(map: &mut Map<String, Json>, field: &str) -> Result<String, CodecError> {
    match map.remove(field) {
        Some(Json::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(CodecError::Invalid(format!("missing {}", field))),
    }
}

/// A statically typed resource with a known kind. The serialized form is the
/// wire body minus `apiVersion`/`kind`: `{ "metadata": .., "spec": .., "status": .. }`.
pub trait TypedObject: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn gvk() -> Gvk;
    fn plural() -> &'static str;
    fn namespaced() -> bool { true }

    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;

    fn to_object(&self) -> Result<Object, CodecError> {
        Object::from_parts(Self::gvk(), serde_json::to_value(self)?)
    }

    fn from_object(obj: &Object) -> Result<Self, CodecError> {
        if !obj.gvk.same_group_kind(&Self::gvk()) {
            return Err(CodecError::Invalid(format!("expected {}, got {}", Self::gvk(), obj.gvk)));
        }
        let mut v = Json::Object(obj.body.clone());
        if let Some(m) = v.as_object_mut() {
            m.insert("metadata".into(), serde_json::to_value(&obj.meta)?);
        }
        Ok(serde_json::from_value(v)?)
    }
}
