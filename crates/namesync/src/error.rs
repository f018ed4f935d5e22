//! Error types for the sync agent.

use namesync_core::CoreError;
use namesync_seal::SealError;
use namesync_store::StoreError;
use namesync_sync::{FetchError, SyncError};
use thiserror::Error;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Delivery error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Naming, encoding or signing error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Group-key error.
    #[error("seal error: {0}")]
    Seal(#[from] SealError),

    /// Blob retrieval failed.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Envelope that cannot be parsed.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Sealed envelope received without a group key.
    #[error("sealed envelope but no group key configured")]
    MissingGroupKey,

    /// Operation not allowed in the agent's current state.
    #[error("misuse: {0}")]
    Misuse(String),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
