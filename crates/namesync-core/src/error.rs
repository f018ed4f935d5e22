//! Error types for namesync core primitives.

use thiserror::Error;

/// Core errors raised while building, encoding, signing or verifying items.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("item is not signed: {0}")]
    MissingSignature(String),

    #[error("no trusted key for {0}")]
    UntrustedKey(String),

    #[error("no verifier accepted {0}")]
    Untrusted(String),

    #[error("name mismatch: expected {expected}, got {actual}")]
    NameMismatch { expected: String, actual: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("invalid name pattern: {0}")]
    InvalidPattern(String),

    #[error("pattern variable {0} is not bound")]
    UnboundVariable(String),

    #[error("schema edge {existing} conflicts with {requested}")]
    SchemaConflict { existing: String, requested: String },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
