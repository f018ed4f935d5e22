//! Agent configuration.

use namesync_core::{Namespace, MAX_ITEM_PAYLOAD};
use namesync_sync::{DeliveryConfig, FetchPolicy};
use serde::{Deserialize, Serialize};

/// Largest update published inline; bigger ones go out as blobs.
pub const DEFAULT_MAX_INLINE_SIZE: usize = 6000;

/// Item bytes kept free for the name, signature and header of a segment.
pub const SEGMENT_OVERHEAD: usize = 800;

/// Largest payload carried by one blob segment.
pub const MAX_SEGMENT_SIZE: usize = MAX_ITEM_PAYLOAD - SEGMENT_OVERHEAD;

/// Configuration for a [`SyncAgent`](crate::SyncAgent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Naming conventions.
    pub namespace: Namespace,
    /// Tuning for both deliveries.
    pub delivery: DeliveryConfig,
    /// Updates up to this size are published inline.
    pub max_inline_size: usize,
    /// Payload bytes per blob segment, capped at [`MAX_SEGMENT_SIZE`].
    pub segment_size: usize,
    /// Policy for on-demand blob fetches.
    pub blob_fetch: FetchPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: Namespace::default(),
            delivery: DeliveryConfig::default(),
            max_inline_size: DEFAULT_MAX_INLINE_SIZE,
            segment_size: MAX_SEGMENT_SIZE,
            blob_fetch: FetchPolicy::blob(),
        }
    }
}
