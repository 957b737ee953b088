//! Engine-level error types.

use crate::quota::QuotaError;
use crate::storage::StorageError;

/// Errors raised while turning a raw event into an encoded event.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    /// Event content was empty after trimming
    #[error("event content cannot be empty")]
    EmptyContent,
    /// Provider returned a vector of the wrong dimension
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Provider returned NaN or infinite components
    #[error("embedding contains non-finite values")]
    NonFiniteEmbedding,
    /// Provider-level failure (model unavailable, inference error)
    #[error("embedding provider failed: {0}")]
    Provider(String),
}

/// Top-level engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Encoding failure
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Quota/idempotency ledger failure
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// Malformed input rejected before any side effect
    #[error("invalid input: {0}")]
    Validation(String),
    /// Configuration rejected at load time
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A referenced memory does not exist for this tenant
    #[error("memory not found: {0}")]
    MemoryNotFound(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;
