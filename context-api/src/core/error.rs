//! Typed failures of the context engine.
//!
//! Every failure reaches the Server API caller as one of these variants;
//! nothing in the core retries or swallows them.

use std::time::Duration;

use crate::models::context::{ContextId, ContextState};

/// Errors raised by the vector index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("vector has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector contains non-finite components")]
    NonFiniteVector,

    #[error("index snapshot is corrupt: {0}")]
    Corrupt(String),
}

/// Errors raised by an embedding provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("embedding input rejected: {0}")]
    InvalidInput(String),

    #[error("embedding has dimension {actual}, corpus expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Error taxonomy of the context store and everything built on it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed or oversized input, rejected before any write.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("context item not found: {0}")]
    NotFound(ContextId),

    #[error("invalid lifecycle transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: ContextId,
        from: ContextState,
        to: ContextState,
    },

    /// The index write failed after the metadata write; the metadata was rolled back.
    #[error("index sync failed for item {id}: {source}")]
    IndexSyncFailed {
        id: ContextId,
        #[source]
        source: IndexError,
    },

    /// Embedding or search exceeded its budget. Partial work is discarded.
    #[error("{operation} timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("corpus capacity exceeded: {size} items, hard cap {cap}")]
    CorpusCapacityExceeded { size: usize, cap: usize },

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }

    /// Whether the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. }
                | StoreError::Embedding(EmbeddingError::Unavailable(_))
                | StoreError::CorpusCapacityExceeded { .. }
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
