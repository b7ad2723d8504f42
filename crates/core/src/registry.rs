//! Explicit kind registry, built once at startup and handed to every component
//! that needs kind resolution (store clients, multiplexers, the applier).

use rustc_hash::FxHashMap;

use crate::{CodecError, Gvk, Object, StoreError, TypedObject};

type Validator = fn(&Object) -> Result<(), CodecError>;

#[derive(Clone)]
pub struct KindInfo {
    pub gvk: Gvk,
    /// Lower-case plural used in API paths, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
    validate: Option<Validator>,
}

impl KindInfo {
    pub fn new(gvk: Gvk, plural: &str, namespaced: bool) -> Self {
        Self { gvk, plural: plural.to_string(), namespaced, validate: None }
    }

    pub fn is_typed(&self) -> bool { self.validate.is_some() }
}

impl std::fmt::Debug for KindInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindInfo")
            .field("gvk", &self.gvk)
            .field("plural", &self.plural)
            .field("namespaced", &self.namespaced)
            .field("typed", &self.is_typed())
            .finish()
    }
}

fn decode_check<T: TypedObject>(obj: &Object) -> Result<(), CodecError> {
    T::from_object(obj).map(|_| ())
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    kinds: FxHashMap<Gvk, KindInfo>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Registry pre-populated with the built-in kinds controllers commonly own.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        let builtins = [
            ("apps", "v1", "Deployment", "deployments", true),
            ("apps", "v1", "StatefulSet", "statefulsets", true),
            ("", "v1", "ConfigMap", "configmaps", true),
            ("", "v1", "Secret", "secrets", true),
            ("", "v1", "Service", "services", true),
            ("", "v1", "ServiceAccount", "serviceaccounts", true),
            ("", "v1", "Namespace", "namespaces", false),
        ];
        for (g, v, k, plural, namespaced) in builtins {
            r.register(KindInfo::new(Gvk::new(g, v, k), plural, namespaced));
        }
        r
    }

    pub fn register(&mut self, info: KindInfo) -> &mut Self {
        self.kinds.insert(info.gvk.clone(), info);
        self
    }

    /// Register a typed kind; its objects are decode-checked by `validate`.
    pub fn register_typed<T: TypedObject>(&mut self) -> &mut Self {
        let mut info = KindInfo::new(T::gvk(), T::plural(), T::namespaced());
        info.validate = Some(decode_check::<T>);
        self.register(info)
    }

    pub fn get(&self, gvk: &Gvk) -> Option<&KindInfo> { self.kinds.get(gvk) }

    pub fn resolve(&self, gvk: &Gvk) -> Result<&KindInfo, StoreError> {
        self.kinds.get(gvk).ok_or_else(|| StoreError::UnknownKind(gvk.key()))
    }

    /// Lookup by group and kind only, as owner references are matched.
    pub fn find_group_kind(&self, group: &str, kind: &str) -> Option<&KindInfo> {
        self.kinds.values().find(|k| k.gvk.group == group && k.gvk.kind == kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindInfo> { self.kinds.values() }

    /// Check that `obj` is well formed for its kind: known kind, scope matches
    /// the namespace, and typed kinds decode.
    pub fn validate(&self, obj: &Object) -> Result<(), StoreError> {
        let info = self.resolve(&obj.gvk)?;
        match (info.namespaced, obj.meta.namespace.as_deref()) {
            (true, None) | (true, Some("")) => {
                return Err(StoreError::Invalid(format!("{} requires a namespace", obj.key())));
            }
            (false, Some(_)) => {
                return Err(StoreError::Invalid(format!("{} is cluster-scoped", obj.key())));
            }
            _ => {}
        }
        if let Some(check) = info.validate {
            check(obj).map_err(|e| StoreError::Invalid(format!("{}: {}", obj.key(), e)))?;
        }
        Ok(())
    }
}
