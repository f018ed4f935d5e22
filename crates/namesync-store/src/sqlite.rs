//! SQLite implementation of the Storage trait.
//!
//! Persistent backend for items and delivery state. Uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use namesync_core::now_millis;

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::Storage;

/// SQLite-backed storage.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStorage {
    /// `None` once closed.
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStorage {
    /// Open a database at `path`, creating and migrating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the open connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let value: Option<Vec<u8>> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn set(&self, key: &str, value: Option<Bytes>) -> Result<()> {
        let key = key.to_owned();
        self.with_conn(move |conn| {
            match value {
                Some(value) => {
                    conn.execute(
                        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                        updated_at = excluded.updated_at",
                        params![key, value.as_ref(), now_millis() as i64],
                    )?;
                }
                None => {
                    conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StoreError::Database(e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StorageExt;
    use namesync_core::{Name, NamedItem};

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let store = SqliteStorage::open_memory().unwrap();
        assert_eq!(store.get("/k").await.unwrap(), None);

        store.set("/k", Some(Bytes::from_static(b"one"))).await.unwrap();
        store.set("/k", Some(Bytes::from_static(b"two"))).await.unwrap();
        assert_eq!(store.get("/k").await.unwrap(), Some(Bytes::from_static(b"two")));
        assert!(store.has("/k").await.unwrap());

        store.set("/k", None).await.unwrap();
        assert!(!store.has("/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = SqliteStorage::open_memory().unwrap();
        store.set("/a", Some(Bytes::from_static(b"1"))).await.unwrap();
        store.set("/b", Some(Bytes::from_static(b"2"))).await.unwrap();

        assert!(store.delete("/a").await.unwrap());
        assert!(!store.delete("/a").await.unwrap());

        store.clear().await.unwrap();
        assert!(!store.has("/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let item = NamedItem::new(Name::parse("/app/alice/seq=3").unwrap(), &b"persist me"[..]);

        {
            let store = SqliteStorage::open(&path).unwrap();
            store.put_item(&item).await.unwrap();
            store.close().await.unwrap();
            assert!(matches!(store.get("/x").await, Err(StoreError::Closed)));
        }

        let store = SqliteStorage::open(&path).unwrap();
        assert_eq!(store.get_item(&item.name).await.unwrap(), Some(item));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_on_blocking_pool() {
        let store = Arc::new(SqliteStorage::open_memory().unwrap());
        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .set(&format!("/k/{i}"), Some(Bytes::from(vec![i as u8])))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        for i in 0..16u8 {
            assert_eq!(
                store.get(&format!("/k/{i}")).await.unwrap(),
                Some(Bytes::from(vec![i]))
            );
        }
    }
}
