//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live record already holds the (organization, kind, name) key.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Stale write (optimistic concurrency control).
    #[error("revision mismatch on {key}: expected {expected}, got {actual}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Entity name contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Uniqueness or revision conflict; surfaced as 409 by API layers.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists(_) | StoreError::RevisionMismatch { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
