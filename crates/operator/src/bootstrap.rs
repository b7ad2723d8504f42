//! Applies one static manifest, owned by the reconciled `MessagingService`.
//! Desired state comes from the manifest, not from the resource's spec.

use std::sync::Arc;

use keel_apply::{Applier, ManifestLoader};
use keel_core::{Action, CodecError, Object, ReconcileError, Request};
use keel_runtime::Reconciler;
use tracing::{debug, info, warn};

use crate::crd::{Condition, MessagingServiceStatus};

pub const ADDRESS_SPACE_CONTROLLER_MANIFEST: &str = "/address-space-controller/050-Deployment-address-space-controller.yaml";
const BOOTSTRAPPED: &str = "Bootstrapped";

pub struct BootstrapReconciler {
    applier: Applier,
    loader: Arc<dyn ManifestLoader>,
    path: String,
}

impl BootstrapReconciler {
    pub fn new(applier: Applier, loader: Arc<dyn ManifestLoader>) -> Self {
        Self { applier, loader, path: ADDRESS_SPACE_CONTROLLER_MANIFEST.to_string() }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Record the manifest outcome on the owner's status under the
    /// `Bootstrapped` condition, leaving everything else as it is. A success
    /// only writes when it clears an earlier failure.
    async fn report(&self, owner: &Object, failure: Option<&str>) -> Result<(), ReconcileError> {
        let previous = MessagingServiceStatus::of(owner);
        let stale = previous.as_ref().and_then(|p| p.condition(BOOTSTRAPPED)).and_then(|c| c.message.clone());
        if failure.is_none() && stale.is_none() {
            return Ok(());
        }
        let mut status = previous.clone().unwrap_or_default();
        if let Some(m) = stale {
            status.messages.retain(|x| *x != m);
        }
        let cond = match failure {
            Some(msg) => {
                status.messages.push(msg.to_string());
                Condition {
                    kind: BOOTSTRAPPED.into(),
                    status: "False".into(),
                    reason: Some("ManifestUnavailable".into()),
                    message: Some(msg.to_string()),
                    ..Default::default()
                }
            }
            None => Condition { kind: BOOTSTRAPPED.into(), status: "True".into(), reason: Some("Applied".into()), ..Default::default() },
        };
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        status.set_condition(cond, previous.as_ref(), &now);
        let json = serde_json::to_value(&status).map_err(CodecError::from)?;
        self.applier.apply_status(owner, json).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reconciler for BootstrapReconciler {
    async fn reconcile(&self, req: &Request) -> Result<Action, ReconcileError> {
        let key = &req.key;
        let Some(owner) = self.applier.store().get(&key.gvk, key.namespace(), &key.name).await? else {
            return Ok(Action::Done);
        };
        if owner.meta.is_deleting() {
            return Ok(Action::Done);
        }
        let mut desired = match self.loader.load(&self.path).await {
            Ok(o) => o,
            Err(e) => {
                let msg = format!("manifest {}: {}", self.path, e);
                warn!(owner = %key, error = %msg, "bootstrap manifest unavailable");
                self.report(&owner, Some(&msg)).await?;
                return Err(ReconcileError::permanent(msg));
            }
        };
        desired.meta.namespace = owner.meta.namespace.clone();
        let res = self.applier.apply_owned(&owner, desired).await?;
        self.report(&owner, None).await?;
        if res.changed() {
            info!(owner = %key, child = %res.object.key(), outcome = ?res.outcome, "bootstrap manifest applied");
        } else {
            debug!(owner = %key, child = %res.object.key(), "bootstrap manifest unchanged");
        }
        Ok(Action::Done)
    }
}
