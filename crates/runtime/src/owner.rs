//! Owner-reference resolution: route events on secondaries to their primary.

use keel_core::{Gvk, Object, ResourceKey};

/// Key of the primary controlling `obj`, when that controller is of kind `owner`.
/// Versions are ignored; owners live in the dependent's namespace unless the
/// owner kind is cluster-scoped.
pub fn controller_owner_key(obj: &Object, owner: &Gvk, owner_namespaced: bool) -> Option<ResourceKey> {
    let r = obj.meta.controller_ref()?;
    if !r.gvk().same_group_kind(owner) {
        return None;
    }
    let ns = if owner_namespaced { obj.namespace() } else { None };
    Some(ResourceKey::new(owner.clone(), ns, &r.name))
}
