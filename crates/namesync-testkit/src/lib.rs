//! # Namesync Testkit
//!
//! Testing utilities for namesync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: participants with keys and storage, a shared in-memory
//!   network, and [`Responder`]s that serve stored items
//! - **Generators**: Proptest strategies for names, state vectors and
//!   update ranges
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use namesync_testkit::fixtures::{Responder, TestFixture, TestNetwork};
//!
//! # async fn example() {
//! let net = TestNetwork::new();
//! let alice = TestFixture::new("/app/alice");
//! let _repo = Responder::serve(&net, alice.node_id.clone(), alice.storage.clone()).await;
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use namesync_testkit::generators::dominating_pair;
//!
//! proptest! {
//!     #[test]
//!     fn diff_is_empty_backwards((older, newer) in dominating_pair(8)) {
//!         prop_assert!(older.diff_ranges(&newer).is_empty());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    init_tracing, multi_party_fixtures, store_item, trusting_verifier, update_channel, wait_until,
    Responder, TestFixture, TestNetwork,
};
