//! # Namesync Store
//!
//! Key/value storage for the sync layer. Items are stored under the text
//! form of their names; delivery state vectors under local-only keys.
//!
//! ## Key Types
//!
//! - [`Storage`] - The async trait for all storage operations
//! - [`StorageExt`] - Item helpers on top of any [`Storage`]
//! - [`SqliteStorage`] - SQLite-based persistent storage
//! - [`MemoryStorage`] - In-memory storage for tests and caches
//!
//! ## Usage
//!
//! ```rust,no_run
//! use namesync_store::{SqliteStorage, Storage};
//!
//! async fn example() {
//!     let store = SqliteStorage::open("sync.db").unwrap();
//!     store.set("/app/alice/seq=1", Some(b"hi".to_vec().into())).await.unwrap();
//!     assert!(store.has("/app/alice/seq=1").await.unwrap());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageExt};
