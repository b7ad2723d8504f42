//! Reconciler for `MessagingService`: one address-space controller Deployment
//! per resource, plus a monitoring ConfigMap while monitoring is enabled.

use std::collections::BTreeMap;
use std::time::Instant;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use keel_apply::Applier;
use keel_core::{Action, CodecError, Object, ReconcileError, Request, TypedObject};
use keel_runtime::Reconciler;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::crd::{Condition, MessagingService, MessagingServiceStatus};
use crate::{config_map_gvk, deployment_gvk, secret_gvk};

pub const FINALIZER: &str = "admin.enmasse.io/cleanup";
pub const DEFAULT_IMAGE: &str = "enmasseproject/address-space-controller:latest";
const CONTAINER: &str = "address-space-controller";
const READY: &str = "Ready";

pub fn deployment_name(ms: &MessagingService) -> String { format!("{}-deploy", ms.name()) }
pub fn monitoring_name(ms: &MessagingService) -> String { format!("{}-monitoring", ms.name()) }

fn labels(ms: &MessagingService) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "enmasse".to_string()),
        ("component".to_string(), CONTAINER.to_string()),
        ("messagingservice".to_string(), ms.name().to_string()),
    ])
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.into()), ..Default::default() }
}

pub fn desired_deployment(ms: &MessagingService) -> Result<Object, CodecError> {
    let labels = labels(ms);
    let mut vars = vec![
        env("ADDRESS_SPACE_NAMESPACE", ms.target_namespace().unwrap_or_default()),
        env("ENABLE_MONITORING", ms.spec.monitoring.enabled.to_string()),
    ];
    if !ms.spec.authentication.is_empty() {
        let kinds: Vec<&str> = ms.spec.authentication.iter().map(|a| a.kind.as_str()).collect();
        vars.push(env("AUTHENTICATION_TYPES", kinds.join(",")));
    }
    if let Some(secret) = ms.spec.admin_secrets().next() {
        vars.push(env("ADMIN_SECRET_NAME", secret));
    }
    let deploy = Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(ms)),
            namespace: ms.namespace().map(str::to_string),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(ms.spec.replicas.unwrap_or(1)),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER.to_string(),
                        image: Some(ms.spec.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())),
                        env: Some(vars),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    Object::from_json(serde_json::to_value(&deploy)?)
}

pub fn desired_monitoring(ms: &MessagingService) -> Result<Object, CodecError> {
    let target = format!("{}.{}", deployment_name(ms), ms.namespace().unwrap_or_default());
    let scrape = format!(
        "scrape_configs:\n- job_name: {}\n  static_configs:\n  - targets: ['{}:8080']\n",
        CONTAINER, target
    );
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(monitoring_name(ms)),
            namespace: ms.namespace().map(str::to_string),
            labels: Some(labels(ms)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("prometheus.yml".to_string(), scrape)])),
        ..Default::default()
    };
    Object::from_json(serde_json::to_value(&cm)?)
}

pub struct MessagingServiceReconciler {
    applier: Applier,
    explicit_cascade: bool,
}

impl MessagingServiceReconciler {
    pub fn new(applier: Applier) -> Self { Self { applier, explicit_cascade: false } }

    /// Delete children through a finalizer instead of relying on the store's
    /// garbage collector.
    pub fn with_explicit_cascade(mut self, on: bool) -> Self {
        self.explicit_cascade = on;
        self
    }

    async fn finalize(&self, obj: &Object) -> Result<Action, ReconcileError> {
        if self.explicit_cascade && obj.meta.has_finalizer(FINALIZER) {
            let n = self.applier.sweep_owned(obj, &[deployment_gvk(), config_map_gvk()]).await?;
            self.applier.remove_finalizer(obj, FINALIZER).await?;
            info!(key = %obj.key(), swept = n, "finalized messaging service");
        }
        Ok(Action::Done)
    }

    /// Problems that need the store: admin secrets must exist next to the resource.
    async fn missing_secrets(&self, ms: &MessagingService) -> Result<Vec<String>, ReconcileError> {
        let mut out = Vec::new();
        for name in ms.spec.admin_secrets() {
            if self.applier.store().get(&secret_gvk(), ms.namespace(), name).await?.is_none() {
                out.push(format!("admin secret {:?} not found in namespace {}", name, ms.namespace().unwrap_or_default()));
            }
        }
        Ok(out)
    }

    /// Write `problems` as the status. Conditions set by other controllers are
    /// kept, and their failure messages stay listed.
    async fn write_status(&self, obj: &Object, problems: &[String], reason: &str) -> Result<(), ReconcileError> {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let previous = MessagingServiceStatus::of(obj);
        let mut status = MessagingServiceStatus {
            messages: problems.to_vec(),
            phase: None,
            observed_generation: obj.meta.generation,
            conditions: previous.as_ref().map(|p| p.conditions.clone()).unwrap_or_default(),
        };
        if let Some(p) = previous.as_ref() {
            for m in p.messages_besides(READY) {
                if !status.messages.iter().any(|x| x == m) {
                    status.messages.push(m.to_string());
                }
            }
        }
        status.phase = Some(if status.messages.is_empty() { "Active" } else { "Failed" }.to_string());
        let ready = if problems.is_empty() {
            Condition { kind: READY.into(), status: "True".into(), reason: Some("Reconciled".into()), ..Default::default() }
        } else {
            Condition {
                kind: READY.into(),
                status: "False".into(),
                reason: Some(reason.to_string()),
                message: Some(problems.join("; ")),
                ..Default::default()
            }
        };
        status.set_condition(ready, previous.as_ref(), &now);
        let json = serde_json::to_value(&status).map_err(CodecError::from)?;
        self.applier.apply_status(obj, json).await?;
        Ok(())
    }

    /// Report a permanent failure on the primary before handing it back.
    async fn fail(&self, obj: &Object, err: ReconcileError, reason: &str) -> Result<Action, ReconcileError> {
        counter!("messaging_invalid_total", 1u64, "reason" => reason.to_string());
        warn!(key = %obj.key(), error = %err, reason, "messaging service cannot be reconciled");
        self.write_status(obj, &[err.to_string()], reason).await?;
        Err(err)
    }

    async fn converge(&self, obj: &Object, ms: &MessagingService) -> Result<(), ReconcileError> {
        let deploy = self.applier.apply_owned(obj, desired_deployment(ms)?).await?;
        if deploy.changed() {
            info!(owner = %obj.key(), child = %deploy.object.key(), outcome = ?deploy.outcome, "deployment applied");
        }
        let mut keep = Vec::new();
        if ms.spec.monitoring.enabled {
            let cm = self.applier.apply_owned(obj, desired_monitoring(ms)?).await?;
            if cm.changed() {
                info!(owner = %obj.key(), child = %cm.object.key(), outcome = ?cm.outcome, "monitoring config applied");
            }
            keep.push(monitoring_name(ms));
        }
        let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
        let pruned = self.applier.prune_owned(obj, &config_map_gvk(), &keep).await?;
        if pruned > 0 {
            debug!(owner = %obj.key(), pruned, "monitoring config removed");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reconciler for MessagingServiceReconciler {
    async fn reconcile(&self, req: &Request) -> Result<Action, ReconcileError> {
        let t0 = Instant::now();
        let key = &req.key;
        let Some(mut obj) = self.applier.store().get(&key.gvk, key.namespace(), &key.name).await? else {
            debug!(key = %key, "messaging service gone");
            return Ok(Action::Done);
        };
        if obj.meta.is_deleting() {
            return self.finalize(&obj).await;
        }
        if self.explicit_cascade {
            obj = self.applier.ensure_finalizer(&obj, FINALIZER).await?;
        }

        let ms = match MessagingService::from_object(&obj) {
            Ok(ms) => ms,
            Err(e) => return self.fail(&obj, ReconcileError::permanent(format!("cannot decode spec: {}", e)), "InvalidSpec").await,
        };
        let mut problems = ms.spec.problems();
        problems.extend(self.missing_secrets(&ms).await?);
        if !problems.is_empty() {
            counter!("messaging_invalid_total", 1u64, "reason" => "InvalidSpec");
            warn!(key = %key, problems = ?problems, "messaging service spec is invalid");
            self.write_status(&obj, &problems, "InvalidSpec").await?;
            return Err(ReconcileError::permanent(problems.join("; ")));
        }

        match self.converge(&obj, &ms).await {
            Ok(()) => {}
            Err(e) if e.is_permanent() => return self.fail(&obj, e, "ApplyFailed").await,
            Err(e) => return Err(e),
        }
        self.write_status(&obj, &[], "Reconciled").await?;
        histogram!("messaging_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(key = %key, took_ms = %t0.elapsed().as_millis(), "messaging service converged");
        Ok(Action::Done)
    }
}
