use std::time::Duration;
use thiserror::Error;

use alert_engine::ValidationError;

/// Failures reported by collaborator clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict writing {0}: object was modified")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Optimistic-concurrency signals worth another read-modify-write round.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::AlreadyExists(_))
    }
}

/// Errors surfaced to callers of the management services.
#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not allowed: {0}")]
    NotAllowed(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: StoreError,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Resync failures. Logged and requeued, never returned to readers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to load {kind}: {source}")]
    Load {
        kind: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Invalid relabel configuration in {secret}: {message}")]
    RelabelConfig { secret: String, message: String },
}
