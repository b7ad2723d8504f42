//! The object store contract consumed by the engine.

use futures::stream::BoxStream;

use crate::{Gvk, Object, Selector, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    /// Progress marker carrying only a resume position.
    Bookmark(String),
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Object> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Bookmark(_) => None,
        }
    }

    /// Resume position after this event.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
            other => other.object().and_then(|o| o.resource_version()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<Object>,
    /// Position to resume a watch from so no change after the list is missed.
    pub resource_version: String,
}

pub type EventStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Versioned object store. Objects handed out are owned copies.
///
/// `update` and `update_status` use `metadata.resourceVersion` of the submitted
/// object as the expected version; a stale version fails with `Conflict`, an
/// absent one is an unconditional write. `update` never changes `status` and
/// `update_status` changes nothing but `status`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<Option<Object>>;

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector) -> StoreResult<ObjectList>;

    /// Stream changes after `resource_version`. Fails with `Gone` (immediately or
    /// as a stream item) once that position has been compacted away.
    async fn watch(&self, gvk: &Gvk, namespace: Option<&str>, selector: &Selector, resource_version: &str) -> StoreResult<EventStream>;

    async fn create(&self, obj: &Object) -> StoreResult<Object>;

    async fn update(&self, obj: &Object) -> StoreResult<Object>;

    async fn update_status(&self, obj: &Object) -> StoreResult<Object>;

    async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> StoreResult<()>;
}
