//! # Namesync
//!
//! Application-facing pub/sub over name-based state-vector sync.
//!
//! ## Overview
//!
//! A [`SyncAgent`] joins a sync group under the application prefix derived
//! from its node id and offers four channels:
//!
//! - **update**: document updates, delivered at least once and replayable
//!   after a restart. Large updates travel as blobs transparently.
//! - **blob**: segmented binary objects, fetched on demand.
//! - **status**: ephemeral per-node state; only the newest value matters.
//! - **blobUpdate**: internal carrier for oversized updates.
//!
//! Updates can be sealed with a shared group key, and a [`Bundler`] can
//! coalesce bursts of small updates before they are published.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use namesync::core::{DigestSigning, Name};
//! use namesync::store::MemoryStorage;
//! use namesync::sync::MemoryNetwork;
//! use namesync::{AgentParams, Channel, SyncAgent};
//!
//! async fn example() -> namesync::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let node_id = Name::parse("/app/alice")?;
//!
//!     let agent = SyncAgent::create(AgentParams::new(
//!         node_id,
//!         Arc::new(MemoryStorage::new()),
//!         Arc::new(network.create_transport()),
//!         Arc::new(DigestSigning),
//!         Arc::new(DigestSigning),
//!     ))
//!     .await?;
//!
//!     agent.register(
//!         Channel::Update,
//!         "doc",
//!         Arc::new(|content, name| println!("{name}: {} bytes", content.len())),
//!     )?;
//!     agent.set_ready(true)?;
//!
//!     agent.publish_update("doc", &b"hello"[..]).await?;
//!     agent.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Crate Organization
//!
//! - [`core`]: names, items, state vectors, signing
//! - [`store`]: key-value storage backends
//! - [`sync`]: transport, gossip and delivery disciplines
//! - [`seal`]: group-key encryption

pub mod agent;
pub mod bundler;
pub mod config;
pub mod envelope;
pub mod error;

pub use agent::{AgentParams, Listener, SyncAgent, UPDATE_SEGMENTS_TOPIC};
pub use bundler::{Bundler, BundlerConfig, Emit, Merge};
pub use config::{AgentConfig, DEFAULT_MAX_INLINE_SIZE, MAX_SEGMENT_SIZE};
pub use envelope::{Channel, Envelope, SEALED_PREFIX};
pub use error::{AgentError, Result};

pub use namesync_core as core;
pub use namesync_seal as seal;
pub use namesync_store as store;
pub use namesync_sync as sync;
