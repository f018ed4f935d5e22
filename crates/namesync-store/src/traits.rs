//! Storage trait: the abstract key/value interface used for item and state
//! persistence.

use async_trait::async_trait;
use bytes::Bytes;
use namesync_core::{Name, NamedItem};

use crate::error::{Result, StoreError};

/// Async key/value storage with string keys and opaque byte values.
///
/// Keys are usually the text form of a [`Name`]. Every method may suspend.
#[async_trait]
pub trait Storage: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Whether a value exists under `key`.
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Store `value` under `key`. `None` deletes the key.
    async fn set(&self, key: &str, value: Option<Bytes>) -> Result<()>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key.
    async fn clear(&self) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Release resources. Later calls return [`StoreError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Helpers for storing encoded [`NamedItem`]s keyed by their name.
#[async_trait]
pub trait StorageExt: Storage {
    /// Store an item under the text form of its name.
    async fn put_item(&self, item: &NamedItem) -> Result<()> {
        self.set(&item.name.to_string(), Some(item.encode())).await
    }

    /// Load and decode the item stored under `name`.
    async fn get_item(&self, name: &Name) -> Result<Option<NamedItem>> {
        let key = name.to_string();
        match self.get(&key).await? {
            Some(bytes) => NamedItem::decode(&bytes)
                .map(Some)
                .map_err(|e| StoreError::InvalidData {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

impl<T: Storage + ?Sized> StorageExt for T {}
