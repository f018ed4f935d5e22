//! # Namesync Sync
//!
//! State-vector gossip and the delivery disciplines built on it.
//!
//! ## Overview
//!
//! Each participant in a sync group publishes numbered items under its own
//! base name and gossips a [`StateVector`](namesync_core::StateVector) of the
//! highest sequence it knows per producer. When a peer's vector is ahead,
//! the missing ranges are fetched with a [`SegmentFetcher`] and handed to the
//! application.
//!
//! ## Layers
//!
//! - [`transport`]: request/response by name, with an in-memory network
//! - [`endpoint`]: single-item fetch with verification and retries
//! - [`fetch`]: pipelined range fetch with RTO estimation and congestion control
//! - [`svs`]: the gossip protocol
//! - [`delivery`]: at-least-once and latest-only disciplines
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-- produce seq=4                   |
//!   |-------- sync /v=3 [A:4] --------->|
//!   |                                   |-- diff: A 1..=4
//!   |<------- /A/.../seq=1..4 ----------|
//!   |-------- items ------------------->|
//!   |                                   |-- deliver, advance watermark
//! ```

pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod fetch;
pub mod svs;
pub mod transport;

pub use delivery::{
    AtLeastOnceDelivery, DeliveryConfig, DeliveryCore, DeliveryParams, LatestOnlyDelivery, Phase,
    ResetHook, UpdateEvent,
};
pub use endpoint::{consume, ConsumeOptions};
pub use error::{FetchError, Result, SyncError, TransportError};
pub use fetch::{
    CongestionControl, Convention, FetchPolicy, FetchStream, FixedCwnd, LimitedCwnd, RttEstimator,
    SegmentFetcher, TcpCubic,
};
pub use svs::{GossipConfig, GossipParams, SvSync, SyncNode, SYNC_VERSION};
pub use transport::{
    memory::MemoryNetwork, memory::MemoryTransport, FnHandler, Handler, Interest, Producer,
    Transport,
};
