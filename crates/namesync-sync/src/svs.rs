//! State-vector gossip.
//!
//! Every participant in a sync group multicasts its [`StateVector`] under
//! the group's sync prefix: periodically, right after publishing, and in
//! reply to peers that are behind. Receiving a vector with higher entries
//! yields [`SyncUpdate`]s on the update channel.
//!
//! ## Timing
//!
//! - A periodic round fires every `periodic` (with `jitter`).
//! - A received vector equal to ours postpones the periodic round.
//! - A received vector missing something we have schedules a reply within
//!   the `suppression` window, so one reply from any member suffices.
//!
//! ## Wire form
//!
//! The request name is `<sync-prefix>/v=3`. Its parameters carry a signed
//! [`NamedItem`] whose content is the encoded vector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use namesync_core::{Component, Name, NamedItem, Signer, StateVector, SyncUpdate, Verifier};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{Handler, Interest, Producer, Transport};

/// Version component appended to the sync prefix.
pub const SYNC_VERSION: u64 = 3;

/// Gossip timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    #[serde(with = "namesync_core::millis")]
    pub periodic: Duration,
    /// Fraction of `periodic` applied as random jitter.
    pub jitter: f64,
    #[serde(with = "namesync_core::millis")]
    pub suppression: Duration,
    #[serde(with = "namesync_core::millis")]
    pub interest_lifetime: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            periodic: Duration::from_secs(30),
            jitter: 0.1,
            suppression: Duration::from_millis(200),
            interest_lifetime: Duration::from_secs(1),
        }
    }
}

/// Everything a gossip instance needs.
#[derive(Clone)]
pub struct GossipParams {
    /// This participant's id in the vector.
    pub own_id: Name,
    pub sync_prefix: Name,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub config: GossipConfig,
}

struct SvSyncInner {
    own_id: Name,
    sync_prefix: Name,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    config: GossipConfig,
    state: Mutex<StateVector>,
    /// Last sequence number handed out for `own_id`.
    reserved: AtomicU64,
    updates: mpsc::UnboundedSender<SyncUpdate>,
    next_round: Mutex<Instant>,
    wake: Notify,
    cancel: CancellationToken,
}

/// A running gossip instance. Closing (or dropping) it stops all traffic.
pub struct SvSync {
    inner: Arc<SvSyncInner>,
    producer: Producer,
    timer: JoinHandle<()>,
}

impl SvSync {
    /// Register on the sync prefix and start gossiping `initial`.
    ///
    /// The first round goes out immediately.
    pub async fn start(
        params: GossipParams,
        initial: StateVector,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncUpdate>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SvSyncInner {
            reserved: AtomicU64::new(initial.get(&params.own_id)),
            own_id: params.own_id,
            sync_prefix: params.sync_prefix,
            transport: params.transport,
            signer: params.signer,
            verifier: params.verifier,
            config: params.config,
            state: Mutex::new(initial),
            updates: tx,
            next_round: Mutex::new(Instant::now()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        let handler = Arc::new(SyncHandler {
            inner: Arc::downgrade(&inner),
        });
        let producer = inner
            .transport
            .produce(inner.sync_prefix.clone(), handler)
            .await?;
        let timer = tokio::spawn(Arc::clone(&inner).run_timer());

        tracing::debug!(prefix = %inner.sync_prefix, id = %inner.own_id, "gossip started");
        Ok((
            Self {
                inner,
                producer,
                timer,
            },
            rx,
        ))
    }

    /// Snapshot of the current vector.
    pub fn state(&self) -> StateVector {
        self.inner.state_snapshot()
    }

    /// Handle for publishing as this participant.
    pub fn node(&self) -> SyncNode {
        SyncNode {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Send a round now.
    pub fn fire(&self) {
        self.inner.schedule(Instant::now());
    }

    /// Stop the timer and unregister. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.producer.close();
        self.timer.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Drop for SvSync {
    fn drop(&mut self) {
        self.close();
    }
}

/// Publishing handle bound to one gossip instance.
#[derive(Clone)]
pub struct SyncNode {
    inner: Arc<SvSyncInner>,
}

impl SyncNode {
    pub fn id(&self) -> &Name {
        &self.inner.own_id
    }

    /// Reserve the next sequence number. Never hands out the same number
    /// twice within one instance.
    pub fn reserve_next(&self) -> u64 {
        self.inner.reserved.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last reserved sequence number.
    pub fn seq_num(&self) -> u64 {
        self.inner.reserved.load(Ordering::SeqCst)
    }

    /// Move the reservation counter. The next reservation returns `seq + 1`.
    /// Nothing is announced until the next publish.
    pub fn set_seq_num(&self, seq: u64) {
        self.inner.reserved.store(seq, Ordering::SeqCst);
    }

    /// Raise our entry to `seq` and send a round now.
    pub fn announce(&self, seq: u64) {
        let changed = self
            .inner
            .lock_state()
            .raise(&self.inner.own_id, seq);
        if changed {
            self.inner.schedule(Instant::now());
        }
    }
}

impl SvSyncInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, StateVector> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn state_snapshot(&self) -> StateVector {
        self.lock_state().clone()
    }

    /// Move the next round to `at` if that is sooner.
    fn schedule(&self, at: Instant) {
        let mut next = match self.next_round.lock() {
            Ok(next) => next,
            Err(poisoned) => poisoned.into_inner(),
        };
        if at < *next {
            *next = at;
            self.wake.notify_one();
        }
    }

    /// Push the next round a full period out.
    fn postpone(&self) {
        let at = Instant::now() + self.periodic_delay();
        let mut next = match self.next_round.lock() {
            Ok(next) => next,
            Err(poisoned) => poisoned.into_inner(),
        };
        *next = at;
        self.wake.notify_one();
    }

    fn periodic_delay(&self) -> Duration {
        let base = self.config.periodic.as_secs_f64();
        let spread = base * self.config.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    fn suppression_delay(&self) -> Duration {
        let window = self.config.suppression.as_millis() as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..window))
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let deadline = match self.next_round.lock() {
                Ok(next) => *next,
                Err(poisoned) => *poisoned.into_inner(),
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.wake.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            if Instant::now() < self.current_deadline() {
                continue;
            }
            self.postpone();
            self.send_round().await;
        }
    }

    fn current_deadline(&self) -> Instant {
        match self.next_round.lock() {
            Ok(next) => *next,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn send_round(&self) {
        let state = self.state_snapshot();
        let name = self.sync_prefix.append(Component::version(SYNC_VERSION));
        let mut item = NamedItem::new(name.clone(), state.encode());
        if let Err(e) = self.signer.sign(&mut item) {
            tracing::error!(prefix = %self.sync_prefix, error = %e, "failed to sign state vector");
            return;
        }
        let interest = Interest::new(name)
            .with_app_parameters(item.encode())
            .with_lifetime(self.config.interest_lifetime);
        if let Err(e) = self.transport.multicast(interest).await {
            tracing::warn!(prefix = %self.sync_prefix, error = %e, "sync round not sent");
        }
    }

    fn on_sync_interest(&self, interest: &Interest) {
        let Some(params) = interest.app_parameters.as_ref() else {
            tracing::debug!(name = %interest.name, "sync interest without state");
            return;
        };
        let item = match NamedItem::decode(params) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable sync interest");
                return;
            }
        };
        if let Err(e) = self.verifier.verify(&item) {
            tracing::warn!(name = %item.name, error = %e, "sync interest failed verification");
            return;
        }
        match StateVector::decode(&item.content) {
            Ok(remote) => self.merge_remote(&remote),
            Err(e) => tracing::warn!(error = %e, "undecodable state vector"),
        }
    }

    fn merge_remote(&self, remote: &StateVector) {
        let mut updates = Vec::new();
        let local_newer = {
            let mut state = self.lock_state();
            for (id, seq) in remote.iter() {
                let known = state.get(id);
                if seq <= known {
                    continue;
                }
                state.set(id.clone(), seq);
                if id == &self.own_id {
                    // Our own entry from before a restart; never reuse those numbers.
                    self.reserved.fetch_max(seq, Ordering::SeqCst);
                } else {
                    updates.push(SyncUpdate::new(id.clone(), known + 1, seq));
                }
            }
            state.newer_than(remote)
        };

        for update in updates {
            tracing::trace!(id = %update.id, lo = update.lo, hi = update.hi, "missing range");
            if self.updates.send(update).is_err() {
                break;
            }
        }

        if local_newer {
            self.schedule(Instant::now() + self.suppression_delay());
        } else {
            self.postpone();
        }
    }
}

struct SyncHandler {
    inner: Weak<SvSyncInner>,
}

#[async_trait]
impl Handler for SyncHandler {
    async fn handle(&self, interest: &Interest) -> Option<NamedItem> {
        let inner = self.inner.upgrade()?;
        if inner.cancel.is_cancelled() {
            return None;
        }
        if interest.name.len() == inner.sync_prefix.len() + 1
            && interest.name.last().and_then(Component::as_version) == Some(SYNC_VERSION)
        {
            inner.on_sync_interest(interest);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use namesync_core::DigestSigning;

    fn n(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    fn params(network: &Arc<MemoryNetwork>, id: &str) -> GossipParams {
        GossipParams {
            own_id: n(id),
            sync_prefix: n("/app/32=sync/32=alo"),
            transport: Arc::new(network.create_transport()),
            signer: Arc::new(DigestSigning),
            verifier: Arc::new(DigestSigning),
            config: GossipConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_announce_reaches_peer() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = SvSync::start(params(&network, "/app/alice"), StateVector::new())
            .await
            .unwrap();
        let (_bob, mut bob_rx) = SvSync::start(params(&network, "/app/bob"), StateVector::new())
            .await
            .unwrap();

        let node = alice.node();
        assert_eq!(node.reserve_next(), 1);
        assert_eq!(node.reserve_next(), 2);
        node.announce(2);

        let update = bob_rx.recv().await.unwrap();
        assert_eq!(update, SyncUpdate::new(n("/app/alice"), 1, 2));
        assert_eq!(alice.state().get(&n("/app/alice")), 2);
    }

    #[tokio::test]
    async fn test_late_joiner_learns_existing_state() {
        let network = MemoryNetwork::new();
        let initial: StateVector = [(n("/app/alice"), 5)].into_iter().collect();
        let (_alice, _rx) = SvSync::start(params(&network, "/app/alice"), initial)
            .await
            .unwrap();

        // Bob's first round shows he is behind; Alice replies within the
        // suppression window.
        let (_bob, mut bob_rx) = SvSync::start(params(&network, "/app/bob"), StateVector::new())
            .await
            .unwrap();
        let update = bob_rx.recv().await.unwrap();
        assert_eq!(update, SyncUpdate::new(n("/app/alice"), 1, 5));
    }

    #[tokio::test]
    async fn test_own_entry_from_peer_bumps_reservation() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = SvSync::start(params(&network, "/app/alice"), StateVector::new())
            .await
            .unwrap();

        alice
            .inner
            .merge_remote(&[(n("/app/alice"), 7)].into_iter().collect());
        assert_eq!(alice.node().reserve_next(), 8);
    }

    #[tokio::test]
    async fn test_closed_instance_ignores_traffic() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = SvSync::start(params(&network, "/app/alice"), StateVector::new())
            .await
            .unwrap();
        let (bob, mut bob_rx) = SvSync::start(params(&network, "/app/bob"), StateVector::new())
            .await
            .unwrap();
        bob.close();
        assert!(bob.is_closed());

        alice.node().announce(1);
        let waited = tokio::time::timeout(Duration::from_millis(300), bob_rx.recv()).await;
        assert!(!matches!(waited, Ok(Some(_))));
    }

    #[test]
    fn test_config_from_json() {
        let config: GossipConfig = serde_json::from_str(r#"{"periodic": 1000}"#).unwrap();
        assert_eq!(config.periodic, Duration::from_secs(1));
        assert_eq!(config.suppression, Duration::from_millis(200));
    }
}
