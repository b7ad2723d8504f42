//! Keel operator: the `MessagingService` resource and its controllers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_apply::{Applier, ManifestLoader};
use keel_core::{Gvk, Registry, TypedObject};
use keel_runtime::{Controller, ControllerConfig};

pub mod bootstrap;
pub mod crd;
pub mod messaging;

pub use bootstrap::BootstrapReconciler;
pub use crd::MessagingService;
pub use messaging::MessagingServiceReconciler;

pub fn deployment_gvk() -> Gvk { Gvk::new("apps", "v1", "Deployment") }
pub fn config_map_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }
pub fn secret_gvk() -> Gvk { Gvk::new("", "v1", "Secret") }

/// Built-in kinds plus `MessagingService`.
pub fn registry() -> Registry {
    let mut r = Registry::with_builtins();
    r.register_typed::<MessagingService>();
    r
}

/// Reconciles `MessagingService` into its Deployment and monitoring ConfigMap.
pub fn messaging_controller(applier: Applier, explicit_cascade: bool, config: ControllerConfig) -> Controller {
    let reconciler = MessagingServiceReconciler::new(applier).with_explicit_cascade(explicit_cascade);
    Controller::new("messagingservice", MessagingService::gvk(), reconciler)
        .owns(deployment_gvk())
        .owns(config_map_gvk())
        .config(config)
}

/// Applies the static address-space controller manifest for every `MessagingService`.
pub fn bootstrap_controller(applier: Applier, loader: Arc<dyn ManifestLoader>, config: ControllerConfig) -> Controller {
    Controller::new("bootstrap", MessagingService::gvk(), BootstrapReconciler::new(applier, loader))
        .owns(deployment_gvk())
        .config(config)
}
