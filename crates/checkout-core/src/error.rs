//! Error Types

use thiserror::Error;

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness constraint or state transition rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Underlying storage failed
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Stored payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error is a uniqueness violation.
    ///
    /// Concurrent webhook deliveries rely on this to tell "someone else already
    /// materialized this" apart from a real failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Check if the operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}
