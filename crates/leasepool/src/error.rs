//! Error types for the leasepool connection pool.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by pool operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Configuration rejected when a pool instance was about to be created.
    #[error("failed to initialize pool: {0}")]
    Initialization(String),

    /// Every handle in the pool is currently leased.
    #[error("failed to lease connection: no available connections")]
    Exhausted,

    /// The handle being returned is not leased from this pool.
    #[error("failed to return connection: connection is not part of this pool")]
    NotLeased,

    /// The underlying connection failed (connect, close, validate, io).
    #[error("connection error: {0}")]
    Resource(String),
}

impl PoolError {
    /// Whether the caller may simply retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted)
    }
}
