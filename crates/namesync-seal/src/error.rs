//! Error types for group-key sealing.

use thiserror::Error;

/// Errors that can occur while sealing or opening payloads.
#[derive(Debug, Error)]
pub enum SealError {
    /// Key material of the wrong size.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Nonce text or bytes that cannot be used.
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption error (wrong key or tampered ciphertext).
    #[error("decryption error: {0}")]
    DecryptionError(String),
}

/// Result type for sealing operations.
pub type Result<T> = std::result::Result<T, SealError>;
