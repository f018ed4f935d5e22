//! In-memory implementation of the Storage trait.
//!
//! Used for tests and for the agent's short-lived latest-only cache.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::traits::Storage;

/// In-memory storage. All data is lost when dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryStorageInner>,
}

#[derive(Default)]
struct MemoryStorageInner {
    entries: HashMap<String, Bytes>,
    closed: bool,
}

impl MemoryStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryStorageInner>> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryStorageInner>> {
        let inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.read()?.entries.get(key).cloned())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.read()?.entries.contains_key(key))
    }

    async fn set(&self, key: &str, value: Option<Bytes>) -> Result<()> {
        let mut inner = self.write()?;
        match value {
            Some(value) => {
                inner.entries.insert(key.to_string(), value);
            }
            None => {
                inner.entries.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.write()?.entries.remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.entries.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        inner.closed = true;
        inner.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StorageExt;
    use namesync_core::{Name, NamedItem};

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStorage::new();
        store.set("/a", Some(Bytes::from_static(b"1"))).await.unwrap();
        assert_eq!(store.get("/a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(store.has("/a").await.unwrap());

        store.set("/a", None).await.unwrap();
        assert!(!store.has("/a").await.unwrap());

        store.set("/b", Some(Bytes::new())).await.unwrap();
        assert!(store.delete("/b").await.unwrap());
        assert!(!store.delete("/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_and_close() {
        let store = MemoryStorage::new();
        store.set("/a", Some(Bytes::from_static(b"1"))).await.unwrap();
        store.set("/b", Some(Bytes::from_static(b"2"))).await.unwrap();
        assert_eq!(store.len(), 2);
        store.clear().await.unwrap();
        assert!(store.is_empty());

        store.close().await.unwrap();
        assert!(matches!(store.get("/a").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_item_helpers() {
        let store = MemoryStorage::new();
        let item = NamedItem::new(Name::parse("/app/alice/seq=1").unwrap(), &b"hello"[..]);
        store.put_item(&item).await.unwrap();
        assert_eq!(store.get_item(&item.name).await.unwrap(), Some(item));

        store.set("/junk", Some(Bytes::from_static(b"\xff"))).await.unwrap();
        let err = store.get_item(&Name::parse("/junk").unwrap()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidData { .. }));
    }
}
