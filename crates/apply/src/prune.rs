//! Removing secondaries a primary no longer wants, and finalizer bookkeeping
//! for stores without an owner garbage collector.

use keel_core::{Gvk, Object, Selector};
use metrics::counter;
use tracing::info;

use crate::{Applier, ApplyError};

impl Applier {
    /// Delete objects of `gvk` controlled by `owner` whose names are not in `keep`.
    pub async fn prune_owned(&self, owner: &Object, gvk: &Gvk, keep: &[&str]) -> Result<usize, ApplyError> {
        let Some(owner_uid) = owner.meta.uid.as_deref() else { return Ok(0) };
        let ns = if self.registry().resolve(gvk)?.namespaced { owner.namespace() } else { None };
        let list = self.store().list(gvk, ns, &Selector::everything()).await?;
        let mut removed = 0;
        for obj in list.items {
            if !obj.meta.is_controlled_by(owner_uid) || keep.contains(&obj.name()) || obj.meta.is_deleting() {
                continue;
            }
            match self.store().delete(gvk, obj.namespace(), obj.name()).await {
                Ok(()) => {
                    removed += 1;
                    info!(owner = %owner.key(), pruned = %obj.key(), "pruned owned object");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed > 0 {
            counter!("apply_pruned_total", removed as u64);
        }
        Ok(removed)
    }

    /// Delete everything `owner` controls across `kinds`.
    pub async fn sweep_owned(&self, owner: &Object, kinds: &[Gvk]) -> Result<usize, ApplyError> {
        let mut n = 0;
        for gvk in kinds {
            n += self.prune_owned(owner, gvk, &[]).await?;
        }
        Ok(n)
    }

    pub async fn ensure_finalizer(&self, obj: &Object, finalizer: &str) -> Result<Object, ApplyError> {
        self.update_with_retry(obj, false, |o| {
            if o.meta.has_finalizer(finalizer) {
                return false;
            }
            o.meta.finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    /// Drop `finalizer`. A deleting object whose last finalizer goes is removed by the store.
    pub async fn remove_finalizer(&self, obj: &Object, finalizer: &str) -> Result<Object, ApplyError> {
        self.update_with_retry(obj, false, |o| {
            let before = o.meta.finalizers.len();
            o.meta.finalizers.retain(|f| f != finalizer);
            o.meta.finalizers.len() != before
        })
        .await
    }
}
