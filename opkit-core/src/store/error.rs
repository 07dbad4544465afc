//! Store error types.

use thiserror::Error;

use crate::model::ResourceKey;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The identity no longer exists in the store.
    #[error("not found: {0}")]
    NotFound(ResourceKey),

    /// Version mismatch (optimistic concurrency control).
    #[error("version conflict on {key}: expected {expected}, store has {actual}")]
    VersionConflict {
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    /// Create of an identity that is already present.
    #[error("already exists: {0}")]
    AlreadyExists(ResourceKey),

    /// Transport-level failure; the write did not happen.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
