//! Static object definitions read from YAML, with size and complexity budgets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use keel_core::{CodecError, Object};
use serde_json::Value as Json;

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("reading {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("no manifest named {0}")]
    Missing(String),
    #[error("YAML payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("YAML document too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("parsing YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(#[from] CodecError),
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Stop counting as soon as the budget is hit.
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse one object from YAML. `ns_override` replaces `metadata.namespace`.
pub fn parse_manifest(yaml: &str, ns_override: Option<&str>) -> Result<Object, ManifestError> {
    parse_with_budget(yaml, ns_override, max_yaml_bytes(), max_yaml_nodes())
}

fn parse_with_budget(yaml: &str, ns_override: Option<&str>, max_bytes: usize, max_nodes: usize) -> Result<Object, ManifestError> {
    if yaml.len() > max_bytes {
        return Err(ManifestError::TooLarge(max_bytes));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let json = serde_json::to_value(val).map_err(CodecError::from)?;
    if json_node_budget_exceeded(&json, max_nodes) {
        return Err(ManifestError::TooComplex(max_nodes));
    }
    let mut obj = Object::from_json(json)?;
    if let Some(ns) = ns_override {
        obj.meta.namespace = Some(ns.to_string());
    }
    Ok(obj)
}

/// Source of static object definitions, addressed by path.
#[async_trait::async_trait]
pub trait ManifestLoader: Send + Sync {
    async fn load(&self, path: &str) -> Result<Object, ManifestError>;
}

/// Reads manifests from disk, relative to `root`.
#[derive(Debug, Clone)]
pub struct FileManifestLoader {
    root: PathBuf,
}

impl FileManifestLoader {
    pub fn new(root: impl AsRef<Path>) -> Self { Self { root: root.as_ref().to_path_buf() } }
}

#[async_trait::async_trait]
impl ManifestLoader for FileManifestLoader {
    async fn load(&self, path: &str) -> Result<Object, ManifestError> {
        let full = self.root.join(path.trim_start_matches('/'));
        let text = tokio::fs::read_to_string(&full)
            .await
            .map_err(|source| ManifestError::Io { path: full.display().to_string(), source })?;
        parse_manifest(&text, None)
    }
}

/// Manifests compiled into the binary or built in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticManifests {
    docs: HashMap<String, String>,
}

impl StaticManifests {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, path: &str, yaml: &str) -> Self {
        self.docs.insert(path.to_string(), yaml.to_string());
        self
    }
}

#[async_trait::async_trait]
impl ManifestLoader for StaticManifests {
    async fn load(&self, path: &str) -> Result<Object, ManifestError> {
        let yaml = self.docs.get(path).ok_or_else(|| ManifestError::Missing(path.to_string()))?;
        parse_manifest(yaml, None)
    }
}
