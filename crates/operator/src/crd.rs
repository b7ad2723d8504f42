//! The `MessagingService` custom resource (`admin.enmasse.io/v1alpha1`).

use keel_core::{Gvk, Meta, Object, TypedObject};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "admin.enmasse.io";
pub const VERSION: &str = "v1alpha1";

pub const AUTH_NONE: &str = "none";
pub const AUTH_STANDARD: &str = "standard";
pub const AUTH_EXTERNAL: &str = "external";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingServiceSpec {
    /// Namespace the address-space controller manages. Defaults to the resource's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authentication: Vec<AuthenticationSpec>,
    #[serde(default)]
    pub monitoring: MonitoringSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

pub fn is_dns_label(s: &str) -> bool { s.len() <= 63 && DNS_LABEL.is_match(s) }

impl MessagingServiceSpec {
    /// Problems detectable from the spec alone, in field order.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(ns) = self.namespace.as_deref() {
            if !is_dns_label(ns) {
                out.push(format!("spec.namespace: {:?} is not a valid namespace name", ns));
            }
        }
        for (i, a) in self.authentication.iter().enumerate() {
            match a.kind.as_str() {
                AUTH_NONE | AUTH_EXTERNAL => {}
                AUTH_STANDARD => {
                    if a.admin_secret_name.as_deref().map_or(true, str::is_empty) {
                        out.push(format!("spec.authentication[{}]: type standard requires adminSecretName", i));
                    }
                }
                other => out.push(format!(
                    "spec.authentication[{}]: unknown type {:?} (expected none, standard or external)",
                    i, other
                )),
            }
        }
        if let Some(r) = self.replicas {
            if r < 0 {
                out.push(format!("spec.replicas: must not be negative, got {}", r));
            }
        }
        out
    }

    /// Admin secrets referenced by `standard` authentication entries.
    pub fn admin_secrets(&self) -> impl Iterator<Item = &str> {
        self.authentication
            .iter()
            .filter(|a| a.kind == AUTH_STANDARD)
            .filter_map(|a| a.admin_secret_name.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingServiceStatus {
    /// Human-readable problems; empty when converged. Always serialized.
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MessagingServiceStatus {
    pub fn condition(&self, kind: &str) -> Option<&Condition> { self.conditions.iter().find(|c| c.kind == kind) }

    /// Set a condition, keeping `lastTransitionTime` when the status value does not flip.
    pub fn set_condition(&mut self, mut cond: Condition, previous: Option<&MessagingServiceStatus>, now: &str) {
        let prior = previous.and_then(|p| p.condition(&cond.kind));
        cond.last_transition_time = match prior {
            Some(p) if p.status == cond.status => p.last_transition_time.clone(),
            _ => Some(now.to_string()),
        };
        match self.conditions.iter_mut().find(|c| c.kind == cond.kind) {
            Some(c) => *c = cond,
            None => self.conditions.push(cond),
        }
    }

    /// Status stored on a raw object, if it decodes. Readable even when the spec is not.
    pub fn of(obj: &Object) -> Option<Self> {
        obj.status().and_then(|s| serde_json::from_value(s.clone()).ok())
    }

    /// Messages of failing conditions other than `kind`.
    pub fn messages_besides(&self, kind: &str) -> impl Iterator<Item = &str> + '_ {
        let kind = kind.to_string();
        self.conditions
            .iter()
            .filter(move |c| c.kind != kind && c.status == "False")
            .filter_map(|c| c.message.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagingService {
    #[serde(default)]
    pub metadata: Meta,
    #[serde(default)]
    pub spec: MessagingServiceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessagingServiceStatus>,
}

impl TypedObject for MessagingService {
    fn gvk() -> Gvk { Gvk::new(GROUP, VERSION, "MessagingService") }
    fn plural() -> &'static str { "messagingservices" }

    fn meta(&self) -> &Meta { &self.metadata }
    fn meta_mut(&mut self) -> &mut Meta { &mut self.metadata }
}

impl MessagingService {
    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }

    /// Namespace handed to the address-space controller.
    pub fn target_namespace(&self) -> Option<&str> {
        self.spec.namespace.as_deref().filter(|s| !s.is_empty()).or(self.namespace())
    }
}
