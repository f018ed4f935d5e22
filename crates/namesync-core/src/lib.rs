//! # Namesync Core
//!
//! Pure primitives for name-based publish/subscribe synchronization.
//!
//! This crate contains no I/O, no storage, no networking. It defines how
//! things are named, how participant state is summarized and compared, and
//! how published items are signed and verified.
//!
//! ## Key Types
//!
//! - [`Name`] / [`Component`] - Hierarchical typed names
//! - [`StateVector`] - Participant name to latest sequence number
//! - [`SyncUpdate`] - A range of sequence numbers one side is missing
//! - [`NamedItem`] - A named, signed payload
//! - [`Signer`] / [`Verifier`] - Pluggable signing and verification
//! - [`Namespace`] - Derivation rules for every name the sync layer uses
//! - [`Pattern`] / [`SchemaTree`] - Name templates and prefix-indexed dispatch
//!
//! ## Encoding
//!
//! Names, state vectors and items encode to CBOR via ciborium.

pub mod chain;
pub mod crypto;
pub mod error;
pub mod item;
pub mod millis;
pub mod name;
pub mod namespace;
pub mod schema;
pub mod state_vector;

pub use chain::{Chain, Flow, VerifierChain};
pub use crypto::{
    Blake3Hash, DigestSigning, Ed25519PublicKey, Ed25519Signer, Ed25519Verifier, Keypair, Signer,
    Verifier,
};
pub use error::{CoreError, Result};
pub use item::{NamedItem, SignatureInfo, SignatureType, DEFAULT_FRESHNESS, MAX_ITEM_PAYLOAD};
pub use name::{component_type, Component, Name};
pub use namespace::Namespace;
pub use schema::{Mapping, MatchValue, Matched, NodeId, Pattern, SchemaTree, Step, ValueKind, Variable};
pub use state_vector::{StateVector, SyncUpdate};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Encode a value to CBOR.
///
/// Writing into a `Vec` cannot fail for the plain data types in this crate.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Bytes {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).expect("CBOR serialization failed");
    Bytes::from(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

/// Report an unrecoverable invariant violation and abort.
///
/// Logs at error level before panicking. Release builds abort on panic.
#[track_caller]
pub fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!("fatal: {message}");
    panic!("fatal: {message}")
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
