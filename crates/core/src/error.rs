use std::time::Duration;

/// Errors surfaced by an `ObjectStore`. Payloads are human-readable object keys or server messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency collision: the submitted resourceVersion is stale.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The watch resume position is no longer retained; a full re-list is required.
    #[error("resume position expired: {0}")]
    Gone(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("invalid: {0}")]
    Invalid(String),
    /// Network or server unavailability.
    #[error("transient: {0}")]
    Transient(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    pub fn is_gone(&self) -> bool { matches!(self, StoreError::Gone(_)) }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnerError {
    #[error("owner {0} has no uid (not yet persisted?)")]
    MissingUid(String),
    #[error("{object} is already controlled by {kind} {name}")]
    AlreadyOwned { object: String, kind: String, name: String },
    #[error("cross-namespace owner reference: {object} in {namespace:?} cannot be owned by {owner}")]
    CrossNamespace { object: String, namespace: Option<String>, owner: String },
}

/// Failure outcome of a reconciliation. Every variant leads to a rate-limited retry;
/// the classification decides what is reported on the primary's status.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed desired state. Retried with backoff since the spec may become valid later.
    #[error("{0}")]
    Permanent(String),
    #[error("reconcile exceeded deadline of {0:?}")]
    Timeout(Duration),
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    pub fn permanent(msg: impl Into<String>) -> Self { ReconcileError::Permanent(msg.into()) }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ReconcileError::Permanent(_)
                | ReconcileError::Store(StoreError::Invalid(_))
                | ReconcileError::Store(StoreError::UnknownKind(_))
        )
    }
}

impl From<CodecError> for ReconcileError {
    fn from(e: CodecError) -> Self { ReconcileError::Permanent(e.to_string()) }
}

impl From<OwnerError> for ReconcileError {
    fn from(e: OwnerError) -> Self { ReconcileError::Permanent(e.to_string()) }
}
