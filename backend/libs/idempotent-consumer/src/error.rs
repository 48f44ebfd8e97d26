//! Error types for idempotent consumer library

use thiserror::Error;

/// Result type for idempotency operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur during idempotent event processing
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Marker store operation failed (connection, timeout, command error)
    #[error("Marker store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Another delivery holds an unfinished claim on the event
    #[error("Event {0} is being processed by another delivery")]
    InProgress(String),

    /// Event ID validation failed (empty, too long)
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if error is transient (should retry)
    ///
    /// A malformed key never becomes valid.
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::Store(err) => redis_utils::is_transient(err),
            IdempotencyError::InProgress(_) => true,
            IdempotencyError::InvalidEventId(_) => false,
            IdempotencyError::Other(_) => false,
        }
    }
}
