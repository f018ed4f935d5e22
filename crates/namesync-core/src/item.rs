//! Named, signed data items.
//!
//! A [`NamedItem`] is the unit that travels over the transport: a name, a
//! payload, a freshness hint, an optional final-block marker for segmented
//! objects, and a signature.
//!
//! The signature covers the [`NamedItem::signed_portion`]: a CBOR encoding of
//! every field except the signature value itself.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::name::Name;

/// Hard ceiling on a single item's payload.
pub const MAX_ITEM_PAYLOAD: usize = 8800;

/// Freshness applied to published items unless the caller overrides it.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(60);

/// Kind of signature attached to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureType {
    /// Blake3 digest of the signed portion. Integrity only.
    Digest,
    /// Ed25519 signature over the signed portion.
    Ed25519,
}

/// Signature block of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub sig_type: SignatureType,
    /// Name of the key that produced the signature, if any.
    pub key_locator: Option<Name>,
    pub value: Bytes,
}

/// A named data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedItem {
    pub name: Name,
    /// How long caches may treat the item as fresh, in milliseconds.
    pub freshness_ms: u64,
    /// Last segment number when this item is part of a segmented object.
    pub final_block: Option<u64>,
    pub content: Bytes,
    pub signature: Option<SignatureInfo>,
}

#[derive(Serialize)]
struct SignedPortion<'a> {
    name: &'a Name,
    freshness_ms: u64,
    final_block: Option<u64>,
    content: &'a Bytes,
    sig_type: SignatureType,
    key_locator: Option<&'a Name>,
}

impl NamedItem {
    /// Create an unsigned item with zero freshness.
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            freshness_ms: 0,
            final_block: None,
            content: content.into(),
            signature: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness_ms = freshness.as_millis() as u64;
        self
    }

    pub fn with_final_block(mut self, final_block: u64) -> Self {
        self.final_block = Some(final_block);
        self
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Bytes covered by a signature of the given type and key locator.
    pub fn signed_portion(&self, sig_type: SignatureType, key_locator: Option<&Name>) -> Bytes {
        crate::to_cbor(&SignedPortion {
            name: &self.name,
            freshness_ms: self.freshness_ms,
            final_block: self.final_block,
            content: &self.content,
            sig_type,
            key_locator,
        })
    }

    /// Encode the whole item, signature included, to CBOR.
    pub fn encode(&self) -> Bytes {
        crate::to_cbor(self)
    }

    /// Decode an item from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        crate::from_cbor(bytes)
    }
}
