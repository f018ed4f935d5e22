//! # Namesync Seal
//!
//! Optional group-key encryption for published payloads.
//!
//! ## Encryption Model
//!
//! A group shares one symmetric [`GroupKey`] distributed out of band. Each
//! payload is sealed with ChaCha20-Poly1305 under a fresh random [`Nonce`];
//! the nonce is carried in the clear next to the ciphertext, so any holder
//! of the key can open it.
//!
//! ## Usage
//!
//! ```rust
//! use namesync_seal::GroupKey;
//!
//! let key = GroupKey::generate();
//! let sealed = key.seal(b"doc update").unwrap();
//! assert_eq!(key.open(&sealed).unwrap().as_ref(), b"doc update");
//! ```

pub mod crypto;
pub mod error;

pub use crypto::{GroupKey, Nonce, Sealed, KEY_LEN, NONCE_LEN};
pub use error::{Result, SealError};
