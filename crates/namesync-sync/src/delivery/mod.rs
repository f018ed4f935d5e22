//! Delivery disciplines on top of state-vector gossip.
//!
//! A delivery owns one gossip instance per epoch, reacts to missing ranges
//! by fetching them, and hands each fetched payload to the update callback.
//! Two disciplines share the machinery in [`DeliveryCore`]:
//!
//! - [`AtLeastOnceDelivery`] persists every item and advances a contiguous
//!   watermark; anything not yet marked is delivered again after restart.
//! - [`LatestOnlyDelivery`] fetches only the newest item per producer.
//!
//! ## Lifecycle
//!
//! ```text
//! Created -> Starting -> Running <-> Resetting
//!                           \-> Destroyed
//! ```
//!
//! Updates that arrive before [`Phase::Running`] are queued. A reset closes
//! the epoch (cancelling its fetches), and opens a new gossip instance seeded
//! with the persisted watermark.

mod at_least_once;
mod latest_only;

pub use at_least_once::AtLeastOnceDelivery;
pub use latest_only::LatestOnlyDelivery;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use namesync_core::{Name, Namespace, Signer, StateVector, SyncUpdate, Verifier};
use namesync_store::Storage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::fetch::FetchPolicy;
use crate::svs::{GossipConfig, GossipParams, SvSync, SyncNode};
use crate::transport::Transport;

/// Callback for each delivered payload: `(content, item name)`.
///
/// At-least-once delivery awaits the returned future before the item counts
/// as delivered.
pub type UpdateEvent = Arc<dyn Fn(Bytes, Name) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called instead of the built-in reset when a delivery hits an
/// unrecoverable error.
pub type ResetHook = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle phase of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Starting,
    Running,
    Resetting,
    Destroyed,
}

/// Delivery tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub gossip: GossipConfig,
    /// Policy for fetching missing sequence ranges.
    pub fetch: FetchPolicy,
    /// Freshness stamped on produced items.
    #[serde(with = "namesync_core::millis")]
    pub freshness: Duration,
    /// Retransmissions for latest-only single fetches.
    pub latest_retx_limit: u32,
    #[serde(with = "namesync_core::millis")]
    pub latest_lifetime: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            gossip: GossipConfig::default(),
            fetch: FetchPolicy::sequence(),
            freshness: namesync_core::DEFAULT_FRESHNESS,
            latest_retx_limit: 3,
            latest_lifetime: Duration::from_secs(1),
        }
    }
}

/// Construction parameters shared by both disciplines.
#[derive(Clone)]
pub struct DeliveryParams {
    pub node_id: Name,
    pub sync_prefix: Name,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub namespace: Namespace,
    pub config: DeliveryConfig,
    pub on_reset: Option<ResetHook>,
}

impl DeliveryParams {
    pub fn new(
        node_id: Name,
        sync_prefix: Name,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            node_id,
            sync_prefix,
            transport,
            signer,
            verifier,
            namespace: Namespace::default(),
            config: DeliveryConfig::default(),
            on_reset: None,
        }
    }

    pub fn with_config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_on_reset(mut self, hook: ResetHook) -> Self {
        self.on_reset = Some(hook);
        self
    }
}

/// Hands a missing range to the owning discipline.
pub(crate) type Dispatch = Arc<dyn Fn(SyncUpdate) + Send + Sync>;

struct Epoch {
    svs: SvSync,
    node: Option<SyncNode>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// State and lifecycle shared by both disciplines.
pub struct DeliveryCore {
    pub(crate) node_id: Name,
    pub(crate) sync_prefix: Name,
    pub(crate) base_name: Name,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) namespace: Namespace,
    pub(crate) config: DeliveryConfig,
    state_store: Arc<dyn Storage>,
    state_key: String,
    phase: watch::Sender<Phase>,
    epoch: Mutex<Option<Epoch>>,
    /// Delivered watermark. Held across storage I/O.
    pub(crate) watermark: tokio::sync::Mutex<StateVector>,
    /// Highest sequence announced per producer since the epoch began.
    pub(crate) last_till_now: Mutex<StateVector>,
    on_update: OnceLock<UpdateEvent>,
    on_reset: Option<ResetHook>,
    dispatch: OnceLock<Dispatch>,
}

impl DeliveryCore {
    /// Load the persisted watermark. Unreadable state starts empty.
    pub(crate) async fn new(params: DeliveryParams, state_store: Arc<dyn Storage>) -> Self {
        let base_name = params
            .namespace
            .base_name(&params.node_id, &params.sync_prefix);
        let state_key = params.namespace.sync_state_key(&base_name);

        let watermark = match state_store.get(&state_key).await {
            Ok(Some(bytes)) => StateVector::decode(&bytes).unwrap_or_else(|e| {
                tracing::error!(key = %state_key, error = %e, "discarding unreadable sync state");
                StateVector::new()
            }),
            Ok(None) => StateVector::new(),
            Err(e) => {
                tracing::error!(key = %state_key, error = %e, "failed to load sync state");
                StateVector::new()
            }
        };

        Self {
            node_id: params.node_id,
            sync_prefix: params.sync_prefix,
            base_name,
            transport: params.transport,
            signer: params.signer,
            verifier: params.verifier,
            namespace: params.namespace,
            config: params.config,
            state_store,
            state_key,
            phase: watch::Sender::new(Phase::Created),
            epoch: Mutex::new(None),
            last_till_now: Mutex::new(watermark.clone()),
            watermark: tokio::sync::Mutex::new(watermark),
            on_update: OnceLock::new(),
            on_reset: params.on_reset,
            dispatch: OnceLock::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn node_id(&self) -> &Name {
        &self.node_id
    }

    pub fn sync_prefix(&self) -> &Name {
        &self.sync_prefix
    }

    /// Prefix of this node's items in the group.
    pub fn base_name(&self) -> &Name {
        &self.base_name
    }

    /// Item prefix of another producer in the group.
    pub(crate) fn base_for(&self, id: &Name) -> Name {
        self.namespace.base_name(id, &self.sync_prefix)
    }

    /// Snapshot of the delivered watermark.
    pub async fn watermark(&self) -> StateVector {
        self.watermark.lock().await.clone()
    }

    /// Snapshot of the gossip vector of the current epoch.
    pub fn gossip_state(&self) -> Option<StateVector> {
        self.lock_epoch().as_ref().map(|epoch| epoch.svs.state())
    }

    pub(crate) fn set_dispatch(&self, dispatch: Dispatch) {
        let _ = self.dispatch.set(dispatch);
    }

    pub(crate) fn on_update(&self) -> Option<UpdateEvent> {
        self.on_update.get().cloned()
    }

    /// Install the update callback. Only allowed once, before `start`.
    pub fn set_on_update(&self, callback: UpdateEvent) -> Result<()> {
        let phase = self.phase();
        if !matches!(phase, Phase::Created | Phase::Starting) {
            tracing::error!(prefix = %self.sync_prefix, ?phase, "update callback installed after start");
            return Err(SyncError::Misuse(format!(
                "update callback installed in phase {phase:?}"
            )));
        }
        self.on_update
            .set(callback)
            .map_err(|_| SyncError::Misuse("update callback already installed".into()))
    }

    fn lock_epoch(&self) -> std::sync::MutexGuard<'_, Option<Epoch>> {
        match self.epoch.lock() {
            Ok(epoch) => epoch,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Publishing handle of the current epoch.
    pub(crate) fn node(&self) -> Result<SyncNode> {
        match self.phase() {
            Phase::Running => {}
            Phase::Destroyed => return Err(SyncError::Destroyed),
            phase => {
                tracing::error!(prefix = %self.sync_prefix, ?phase, "produce before start");
                return Err(SyncError::Misuse(format!("produce in phase {phase:?}")));
            }
        }
        self.lock_epoch()
            .as_ref()
            .and_then(|epoch| epoch.node.clone())
            .ok_or_else(|| SyncError::Misuse("no sync node in this epoch".into()))
    }

    /// Cancellation token of the current epoch.
    pub(crate) fn epoch_token(&self) -> CancellationToken {
        self.lock_epoch()
            .as_ref()
            .map(|epoch| epoch.cancel.clone())
            .unwrap_or_else(|| {
                let token = CancellationToken::new();
                token.cancel();
                token
            })
    }

    /// Open the first epoch. Created -> Starting.
    pub(crate) async fn init(&self) -> Result<()> {
        let seed = self.watermark.lock().await.clone();
        let epoch = self.open_epoch(seed).await?;
        *self.lock_epoch() = Some(epoch);
        self.phase.send_replace(Phase::Starting);
        Ok(())
    }

    /// Starting -> Running. Requires the update callback.
    pub fn start(&self) -> Result<()> {
        let phase = self.phase();
        if phase != Phase::Starting {
            return Err(SyncError::Misuse(format!("start in phase {phase:?}")));
        }
        if self.on_update.get().is_none() {
            return Err(SyncError::Misuse("start without update callback".into()));
        }
        self.phase.send_replace(Phase::Running);
        Ok(())
    }

    /// Send a gossip round now.
    pub fn fire(&self) {
        if let Some(epoch) = self.lock_epoch().as_ref() {
            epoch.svs.fire();
        }
    }

    async fn open_epoch(&self, seed: StateVector) -> Result<Epoch> {
        let params = GossipParams {
            own_id: self.node_id.clone(),
            sync_prefix: self.sync_prefix.clone(),
            transport: Arc::clone(&self.transport),
            signer: Arc::clone(&self.signer),
            verifier: Arc::clone(&self.verifier),
            config: self.config.gossip.clone(),
        };
        let (svs, updates) = SvSync::start(params, seed).await?;
        let cancel = CancellationToken::new();
        let pump = self.spawn_pump(updates, cancel.clone());
        Ok(Epoch {
            node: Some(svs.node()),
            svs,
            cancel,
            pump,
        })
    }

    /// Forward updates to the discipline once running.
    fn spawn_pump(
        &self,
        mut updates: mpsc::UnboundedReceiver<SyncUpdate>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatch = self.dispatch.get().cloned();
        let mut phase = self.phase.subscribe();
        tokio::spawn(async move {
            let Some(dispatch) = dispatch else {
                return;
            };
            loop {
                let update = tokio::select! {
                    _ = cancel.cancelled() => return,
                    update = updates.recv() => match update {
                        Some(update) => update,
                        None => return,
                    },
                };
                let ready = tokio::select! {
                    _ = cancel.cancelled() => return,
                    ready = phase.wait_for(|p| matches!(p, Phase::Running | Phase::Destroyed)) => {
                        matches!(ready.as_deref(), Ok(Phase::Running))
                    }
                };
                if !ready {
                    return;
                }
                dispatch(update);
            }
        })
    }

    /// Close the epoch after an unrecoverable error: stop gossip and drop
    /// the publishing handle. The epoch record stays until reset.
    pub(crate) fn abort_epoch(&self) {
        if let Some(epoch) = self.lock_epoch().as_mut() {
            epoch.cancel.cancel();
            epoch.svs.close();
            epoch.node = None;
        }
    }

    /// Whether a caller-supplied hook handles resets.
    pub(crate) fn reset_hook(&self) -> Option<ResetHook> {
        self.on_reset.clone()
    }

    /// Replace the epoch with a fresh gossip instance seeded with the
    /// persisted watermark. No-op while resetting or after destroy.
    pub async fn reset(&self) -> Result<()> {
        let previous = {
            let mut transitioned = None;
            self.phase.send_if_modified(|phase| match phase {
                Phase::Resetting | Phase::Destroyed => false,
                current => {
                    transitioned = Some(*current);
                    *current = Phase::Resetting;
                    true
                }
            });
            match transitioned {
                Some(previous) => previous,
                None => return Ok(()),
            }
        };
        tracing::warn!(prefix = %self.sync_prefix, "resetting delivery");

        let reserved = {
            let mut guard = self.lock_epoch();
            // An aborted epoch has dropped its node handle, but its gossip
            // instance still holds the reservation counter.
            let reserved = guard.as_ref().map(|e| e.svs.node().seq_num());
            if let Some(epoch) = guard.take() {
                epoch.cancel.cancel();
                epoch.svs.close();
                epoch.pump.abort();
            }
            reserved
        };

        let seed = self.watermark.lock().await.clone();
        *self.lock_last_till_now() = seed.clone();

        let epoch = match self.open_epoch(seed).await {
            Ok(epoch) => epoch,
            Err(e) => {
                tracing::error!(prefix = %self.sync_prefix, error = %e, "failed to reopen gossip");
                self.phase.send_replace(previous);
                return Err(e);
            }
        };
        if let (Some(node), Some(reserved)) = (epoch.node.as_ref(), reserved) {
            if reserved > node.seq_num() {
                node.set_seq_num(reserved);
            }
        }
        epoch.svs.fire();

        let destroyed = {
            let mut guard = self.lock_epoch();
            if self.phase() == Phase::Destroyed {
                true
            } else {
                *guard = Some(epoch);
                false
            }
        };
        if !destroyed {
            let next = if previous == Phase::Starting {
                Phase::Starting
            } else {
                Phase::Running
            };
            self.phase.send_replace(next);
        }
        Ok(())
    }

    /// Terminal. Flushes the watermark and closes gossip.
    pub async fn destroy(&self) {
        if self.phase.send_replace(Phase::Destroyed) == Phase::Destroyed {
            return;
        }
        let epoch = self.lock_epoch().take();
        if let Some(epoch) = epoch {
            epoch.cancel.cancel();
            epoch.svs.close();
            epoch.pump.abort();
        }
        let watermark = self.watermark.lock().await;
        if let Err(e) = self.persist_watermark(&watermark).await {
            tracing::error!(prefix = %self.sync_prefix, error = %e, "failed to flush sync state");
        }
        tracing::debug!(prefix = %self.sync_prefix, "delivery destroyed");
    }

    pub(crate) fn lock_last_till_now(&self) -> std::sync::MutexGuard<'_, StateVector> {
        match self.last_till_now.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write the watermark to the state store.
    pub(crate) async fn persist_watermark(&self, watermark: &StateVector) -> Result<()> {
        self.state_store
            .set(&self.state_key, Some(watermark.encode()))
            .await?;
        Ok(())
    }

    /// Raise our own entry after a local publish and persist it.
    pub(crate) async fn mark_own(&self, seq: u64) -> Result<()> {
        let mut watermark = self.watermark.lock().await;
        if watermark.raise(&self.node_id, seq) {
            self.persist_watermark(&watermark).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_json() {
        let config = DeliveryConfig::default();
        assert_eq!(config.freshness, Duration::from_secs(60));
        assert_eq!(config.fetch.retx_limit, 600);

        let parsed: DeliveryConfig =
            serde_json::from_str(r#"{"freshness": 5000, "gossip": {"suppression": 50}}"#).unwrap();
        assert_eq!(parsed.freshness, Duration::from_secs(5));
        assert_eq!(parsed.gossip.suppression, Duration::from_millis(50));
        assert_eq!(parsed.gossip.periodic, Duration::from_secs(30));
    }
}
