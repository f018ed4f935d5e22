//! Signing and verification of named items.
//!
//! The sync layer never looks inside a signature. It hands items to a
//! [`Signer`] before publishing and to a [`Verifier`] after fetching.
//!
//! ## Provided implementations
//!
//! - [`DigestSigning`] - Blake3 digest, integrity only. Signs and verifies.
//! - [`Ed25519Signer`] - signs with a [`Keypair`] under a key name.
//! - [`Ed25519Verifier`] - checks signatures against trusted key names.

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::item::{NamedItem, SignatureInfo, SignatureType};
use crate::name::Name;

/// Attaches a signature to an item in place.
pub trait Signer: Send + Sync {
    fn sign(&self, item: &mut NamedItem) -> Result<()>;
}

/// Checks the signature of a fetched item.
pub trait Verifier: Send + Sync {
    fn verify(&self, item: &NamedItem) -> Result<()>;
}

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a raw signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_slice(signature).map_err(|_| CoreError::InvalidSignature)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

/// An Ed25519 keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Digest "signature": Blake3 over the signed portion.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSigning;

impl Signer for DigestSigning {
    fn sign(&self, item: &mut NamedItem) -> Result<()> {
        let digest = Blake3Hash::hash(&item.signed_portion(SignatureType::Digest, None));
        item.signature = Some(SignatureInfo {
            sig_type: SignatureType::Digest,
            key_locator: None,
            value: Bytes::copy_from_slice(digest.as_bytes()),
        });
        Ok(())
    }
}

impl Verifier for DigestSigning {
    fn verify(&self, item: &NamedItem) -> Result<()> {
        let sig = item
            .signature
            .as_ref()
            .ok_or_else(|| CoreError::MissingSignature(item.name.to_string()))?;
        if sig.sig_type != SignatureType::Digest {
            return Err(CoreError::InvalidSignature);
        }
        let digest = Blake3Hash::hash(&item.signed_portion(SignatureType::Digest, None));
        if sig.value.as_ref() != digest.as_bytes() {
            return Err(CoreError::InvalidSignature);
        }
        Ok(())
    }
}

/// Signs items with an Ed25519 key published under `key_name`.
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    keypair: Keypair,
    key_name: Name,
}

impl Ed25519Signer {
    pub fn new(keypair: Keypair, key_name: Name) -> Self {
        Self { keypair, key_name }
    }

    pub fn key_name(&self) -> &Name {
        &self.key_name
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.keypair.public_key()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, item: &mut NamedItem) -> Result<()> {
        let portion = item.signed_portion(SignatureType::Ed25519, Some(&self.key_name));
        let value = self.keypair.sign(&portion);
        item.signature = Some(SignatureInfo {
            sig_type: SignatureType::Ed25519,
            key_locator: Some(self.key_name.clone()),
            value: Bytes::copy_from_slice(&value),
        });
        Ok(())
    }
}

/// Verifies Ed25519 signatures whose key locator names a trusted key.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    trusted: HashMap<Name, Ed25519PublicKey>,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `key` for items whose key locator is `key_name`.
    pub fn trust(mut self, key_name: Name, key: Ed25519PublicKey) -> Self {
        self.trusted.insert(key_name, key);
        self
    }
}

impl Verifier for Ed25519Verifier {
    fn verify(&self, item: &NamedItem) -> Result<()> {
        let sig = item
            .signature
            .as_ref()
            .ok_or_else(|| CoreError::MissingSignature(item.name.to_string()))?;
        if sig.sig_type != SignatureType::Ed25519 {
            return Err(CoreError::InvalidSignature);
        }
        let key_name = sig.key_locator.as_ref().ok_or(CoreError::InvalidSignature)?;
        let key = self
            .trusted
            .get(key_name)
            .ok_or_else(|| CoreError::UntrustedKey(key_name.to_string()))?;
        let portion = item.signed_portion(SignatureType::Ed25519, Some(key_name));
        key.verify(&portion, &sig.value)
    }
}
