use appset_core::{GeneratorKind, ObjectKey};
use appset_store::StoreError;

/// Why a reconcile pass stopped. Every variant reaches the caller of the pass.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("generator {kind}: parameter expansion failed: {source}")]
    GeneratorExpansionFailed {
        kind: GeneratorKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("generator {kind}: render failed: {source}")]
    RenderFailed {
        kind: GeneratorKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("no generator registered for kind {0}")]
    UnknownGeneratorKind(GeneratorKind),
    /// Stale resourceVersion or a racing create/delete; retry with a fresh pass.
    #[error("store write conflict: {0}")]
    StoreWriteConflict(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("duplicate application name: {0}")]
    DuplicateDesiredName(String),
    #[error("invalid application: {0}")]
    InvalidResource(String),
    #[error("{key} is controlled by {owner_kind} {owner_name}")]
    ForeignOwner { key: ObjectKey, owner_kind: String, owner_name: String },
}

impl EngineError {
    /// Errors a later pass can be expected to clear on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreWriteConflict(_) | EngineError::StoreUnavailable(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => EngineError::StoreWriteConflict(msg),
            StoreError::AlreadyExists(key) => EngineError::StoreWriteConflict(format!("{} already exists", key)),
            StoreError::NotFound(key) => EngineError::StoreWriteConflict(format!("{} disappeared", key)),
            StoreError::Invalid(msg) => EngineError::InvalidResource(msg),
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
        }
    }
}
