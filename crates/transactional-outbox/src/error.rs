//! Error types for the transactional outbox store.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Row not found in outbox
    #[error("Outbox row not found: {0}")]
    RowNotFound(Uuid),

    /// The transaction handle passed to the publisher is not the concrete
    /// type this store expects (currently: a Postgres transaction).
    #[error("transaction handle type mismatch: expected a Postgres transaction handle")]
    WrongTransactionType,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}
