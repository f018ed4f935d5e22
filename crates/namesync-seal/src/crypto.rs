//! Symmetric group-key encryption.
//!
//! Every member of a group holds the same 256-bit key. Each payload is
//! sealed with ChaCha20-Poly1305 under a fresh random 96-bit nonce, and the
//! nonce travels next to the ciphertext.

use std::fmt;

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce as AeadNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SealError};

/// Length of a group key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// A 256-bit symmetric key shared by a group.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey([u8; KEY_LEN]);

impl GroupKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Import raw key bits.
    pub fn from_bits(bits: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bits.try_into().map_err(|_| SealError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bits.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Export the raw key bits.
    pub fn bits(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Encrypt under a fresh nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed> {
        let nonce = Nonce::generate();
        let ciphertext = self.encrypt(plaintext, &nonce)?;
        Ok(Sealed { nonce, ciphertext })
    }

    /// Decrypt a sealed payload.
    pub fn open(&self, sealed: &Sealed) -> Result<Bytes> {
        self.decrypt(&sealed.ciphertext, &sealed.nonce)
    }

    /// Encrypt data with this key and an explicit nonce.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &Nonce) -> Result<Bytes> {
        self.cipher()
            .encrypt(AeadNonce::from_slice(&nonce.0), plaintext)
            .map(Bytes::from)
            .map_err(|e| SealError::EncryptionError(e.to_string()))
    }

    /// Decrypt data with this key.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &Nonce) -> Result<Bytes> {
        self.cipher()
            .decrypt(AeadNonce::from_slice(&nonce.0), ciphertext)
            .map(Bytes::from)
            .map_err(|e| SealError::DecryptionError(e.to_string()))
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupKey(..)")
    }
}

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; NONCE_LEN]);

impl Nonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form. Dashes are ignored.
    pub fn from_hex(text: &str) -> Result<Self> {
        let cleaned: String = text.chars().filter(|c| *c != '-').collect();
        let bytes = hex::decode(&cleaned).map_err(|e| SealError::InvalidNonce(e.to_string()))?;
        let bytes: [u8; NONCE_LEN] = bytes.as_slice().try_into().map_err(|_| {
            SealError::InvalidNonce(format!("expected {NONCE_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

/// Ciphertext plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: Nonce,
    /// Includes the authentication tag.
    pub ciphertext: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = GroupKey::generate();
        let sealed = key.seal(b"hello, group").unwrap();
        assert_ne!(sealed.ciphertext.as_ref(), b"hello, group");

        let opened = key.open(&sealed).unwrap();
        assert_eq!(opened.as_ref(), b"hello, group");
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = GroupKey::generate();
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let sealed = GroupKey::generate().seal(b"secret").unwrap();
        assert!(matches!(
            GroupKey::generate().open(&sealed),
            Err(SealError::DecryptionError(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = GroupKey::generate();
        let mut sealed = key.seal(b"secret").unwrap();
        let mut bytes = sealed.ciphertext.to_vec();
        bytes[0] ^= 0x01;
        sealed.ciphertext = Bytes::from(bytes);
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn test_key_bits_import() {
        let key = GroupKey::generate();
        let imported = GroupKey::from_bits(key.bits()).unwrap();
        assert_eq!(key, imported);

        match GroupKey::from_bits(&[0u8; 16]) {
            Err(SealError::InvalidKeyLength { expected, actual }) => {
                assert_eq!((expected, actual), (32, 16));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_nonce_hex() {
        let nonce = Nonce::from_bytes([0xab; 12]);
        assert_eq!(nonce.to_hex(), "abababababababababababab");
        assert_eq!(Nonce::from_hex("abababab-abababab-abababab").unwrap(), nonce);
        assert!(Nonce::from_hex("abab").is_err());
        assert!(Nonce::from_hex("zz").is_err());
    }
}
