//! Error types for the sync module.

use thiserror::Error;

/// Errors from a single request over the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No producer is registered for the name.
    #[error("no route for {0}")]
    NoRoute(String),

    /// No data came back within the request lifetime.
    #[error("timed out fetching {0}")]
    Timeout(String),

    /// A producer explicitly refused the request.
    #[error("nack for {name}: {reason}")]
    Nack { name: String, reason: String },

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::NoRoute(_) | TransportError::Timeout(_) | TransportError::Nack { .. }
        )
    }
}

/// Errors from fetching one or more items.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retries for one name ran out.
    #[error("retry budget exhausted for {name} after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        name: String,
        attempts: u32,
        last: TransportError,
    },

    /// A fetched item failed verification.
    #[error("verification failed for {name}: {reason}")]
    Verification { name: String, reason: String },

    /// The fetch was cancelled.
    #[error("fetch cancelled")]
    Cancelled,

    /// A non-retryable transport error.
    #[error("transport error: {0}")]
    Transport(TransportError),
}

/// Errors from sync and delivery operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation was called in a state that does not allow it.
    #[error("misuse: {0}")]
    Misuse(String),

    /// The delivery has been destroyed.
    #[error("delivery destroyed")]
    Destroyed,

    #[error("store error: {0}")]
    Store(#[from] namesync_store::StoreError),

    #[error("core error: {0}")]
    Core(#[from] namesync_core::CoreError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
