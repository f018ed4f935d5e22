//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored value could not be decoded.
    #[error("invalid data under {key}: {reason}")]
    InvalidData { key: String, reason: String },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The store was closed.
    #[error("store is closed")]
    Closed,

    /// A lock guarding the backend was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    /// A blocking database task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
