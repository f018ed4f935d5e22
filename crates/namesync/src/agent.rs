//! The sync agent: application channels on top of the two deliveries.
//!
//! A [`SyncAgent`] runs one at-least-once and one latest-only delivery
//! under the application prefix derived from its node id, and multiplexes
//! application traffic over them as [`Envelope`]s:
//!
//! | channel      | delivery      | payload                              |
//! |--------------|---------------|--------------------------------------|
//! | `update`     | at-least-once | update bytes, sealed with a group key |
//! | `blobUpdate` | at-least-once | name of a blob holding a large update |
//! | `blob`       | at-least-once | name of a segmented blob              |
//! | `status`     | latest-only   | status bytes                          |
//!
//! The agent also answers requests for everything it stores, and announces
//! its node id so that requests for its own items reach it before any
//! replica serving the application prefix.
//!
//! ## Readiness
//!
//! Deliveries do not dispatch until [`SyncAgent::set_ready`] is called.
//! Every `update` listener must be registered before that point; an update
//! dispatched to a not-ready agent is a program bug and aborts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use namesync_core::{fatal, Component, Name, NamedItem, Signer, StateVector, Verifier};
use namesync_seal::GroupKey;
use namesync_store::{MemoryStorage, Storage, StorageExt};
use namesync_sync::{
    AtLeastOnceDelivery, Convention, DeliveryParams, Handler, Interest, LatestOnlyDelivery,
    Producer, ResetHook, SegmentFetcher, SyncError, Transport, UpdateEvent,
};
use tokio_util::sync::CancellationToken;

use crate::bundler::{Bundler, BundlerConfig, Emit, Merge};
use crate::config::{AgentConfig, MAX_SEGMENT_SIZE};
use crate::envelope::{Channel, Envelope};
use crate::error::{AgentError, Result};

/// Topic under which oversized updates are stored as blobs.
pub const UPDATE_SEGMENTS_TOPIC: &str = "updateSeg";

/// Application callback: `(content, item name)`.
pub type Listener = Arc<dyn Fn(Bytes, Name) + Send + Sync>;

/// Construction parameters for [`SyncAgent::create`].
#[derive(Clone)]
pub struct AgentParams {
    pub node_id: Name,
    /// Items, blobs and delivery state. Must outlive restarts.
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    /// Called before both deliveries reset after an unrecoverable error.
    pub on_reset: Option<ResetHook>,
    /// Raw bits of the group key sealing `update` envelopes.
    pub group_key_bits: Option<Vec<u8>>,
    pub config: AgentConfig,
}

impl AgentParams {
    pub fn new(
        node_id: Name,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            node_id,
            storage,
            transport,
            signer,
            verifier,
            on_reset: None,
            group_key_bits: None,
            config: AgentConfig::default(),
        }
    }

    pub fn with_on_reset(mut self, hook: ResetHook) -> Self {
        self.on_reset = Some(hook);
        self
    }

    pub fn with_group_key_bits(mut self, bits: impl Into<Vec<u8>>) -> Self {
        self.group_key_bits = Some(bits.into());
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }
}

/// Multiplexes application channels over the sync deliveries.
pub struct SyncAgent {
    node_id: Name,
    app_prefix: Name,
    persistent: Arc<dyn Storage>,
    temporary: Arc<MemoryStorage>,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    config: AgentConfig,
    at_least_once: Arc<AtLeastOnceDelivery>,
    latest_only: Arc<LatestOnlyDelivery>,
    on_reset: Option<ResetHook>,
    group_key: Option<GroupKey>,
    listeners: RwLock<HashMap<(Channel, String), Listener>>,
    ready: AtomicBool,
    producers: Mutex<Vec<Producer>>,
    cancel: CancellationToken,
}

impl SyncAgent {
    /// Create both deliveries and start answering requests.
    ///
    /// The agent is not ready: register listeners, then call
    /// [`set_ready`](Self::set_ready).
    pub async fn create(params: AgentParams) -> Result<Arc<Self>> {
        let group_key = params
            .group_key_bits
            .as_deref()
            .map(GroupKey::from_bits)
            .transpose()?;

        let namespace = params.config.namespace.clone();
        let app_prefix = namespace.app_prefix_from_node_id(&params.node_id);
        let temporary = Arc::new(MemoryStorage::new());

        let this_cell: Arc<OnceLock<Weak<SyncAgent>>> = Arc::new(OnceLock::new());
        let cell = Arc::clone(&this_cell);
        let reset_hook: ResetHook = Arc::new(move || {
            if let Some(agent) = cell.get().and_then(Weak::upgrade) {
                tokio::spawn(async move { agent.on_reset_triggered().await });
            }
        });

        let delivery_params = |prefix: Name| {
            DeliveryParams::new(
                params.node_id.clone(),
                prefix,
                Arc::clone(&params.transport),
                Arc::clone(&params.signer),
                Arc::clone(&params.verifier),
            )
            .with_namespace(namespace.clone())
            .with_config(params.config.delivery.clone())
            .with_on_reset(Arc::clone(&reset_hook))
        };

        let latest_only = LatestOnlyDelivery::create(
            delivery_params(namespace.latest_only_prefix(&app_prefix)),
            temporary.clone(),
            Arc::clone(&params.storage),
        )
        .await?;
        let at_least_once = match AtLeastOnceDelivery::create(
            delivery_params(namespace.at_least_once_prefix(&app_prefix)),
            Arc::clone(&params.storage),
        )
        .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                latest_only.destroy().await;
                return Err(e.into());
            }
        };

        let agent = Arc::new(Self {
            node_id: params.node_id,
            app_prefix,
            persistent: params.storage,
            temporary,
            transport: params.transport,
            signer: params.signer,
            verifier: params.verifier,
            config: params.config,
            at_least_once,
            latest_only,
            on_reset: params.on_reset,
            group_key,
            listeners: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        let _ = this_cell.set(Arc::downgrade(&agent));

        let weak = Arc::downgrade(&agent);
        let on_update: UpdateEvent = Arc::new(move |content, name| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.on_update(content, name).await;
                }
            })
        });
        agent.at_least_once.set_on_update(on_update.clone())?;
        agent.latest_only.set_on_update(on_update)?;

        if let Err(e) = agent.register_producers().await {
            agent.destroy().await;
            return Err(e);
        }
        tracing::info!(node = %agent.node_id, prefix = %agent.app_prefix, "sync agent created");
        Ok(agent)
    }

    async fn register_producers(self: &Arc<Self>) -> Result<()> {
        let serve = Arc::new(ServeHandler {
            agent: Arc::downgrade(self),
        });
        let producer = self
            .transport
            .produce(self.app_prefix.clone(), serve)
            .await
            .map_err(SyncError::from)?;
        // Announcing the node id draws requests for our own items here first.
        let attractor = self
            .transport
            .produce(self.node_id.clone(), Arc::new(Silent))
            .await
            .map_err(SyncError::from)?;

        let mut producers = self.lock_producers();
        producers.push(producer);
        producers.push(attractor);
        Ok(())
    }

    fn lock_producers(&self) -> std::sync::MutexGuard<'_, Vec<Producer>> {
        match self.producers.lock() {
            Ok(producers) => producers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn node_id(&self) -> &Name {
        &self.node_id
    }

    pub fn app_prefix(&self) -> &Name {
        &self.app_prefix
    }

    pub fn at_least_once(&self) -> &Arc<AtLeastOnceDelivery> {
        &self.at_least_once
    }

    pub fn latest_only(&self) -> &Arc<LatestOnlyDelivery> {
        &self.latest_only
    }

    /// Raw bits of the group key, if one is configured.
    pub fn group_key_bits(&self) -> Option<[u8; 32]> {
        self.group_key.as_ref().map(|key| *key.bits())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Readiness and listeners
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Start processing updates. Readiness cannot be withdrawn.
    pub fn set_ready(&self, ready: bool) -> Result<()> {
        if !ready {
            if self.is_ready() {
                return Err(AgentError::Misuse(
                    "gossip cannot be stopped once the agent is ready".into(),
                ));
            }
            return Ok(());
        }
        if self.ready.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.at_least_once.start()?;
        self.latest_only.start()?;
        tracing::debug!(node = %self.node_id, "sync agent ready");
        Ok(())
    }

    /// Install the listener for `(channel, topic)`, replacing any previous
    /// one.
    pub fn register(&self, channel: Channel, topic: &str, listener: Listener) -> Result<()> {
        if channel == Channel::Update && self.is_ready() {
            tracing::error!(topic, "update listener registered after the agent became ready");
            return Err(AgentError::Misuse(format!(
                "update listener for {topic} registered after ready"
            )));
        }
        self.write_listeners()
            .insert((channel, topic.to_string()), listener);
        Ok(())
    }

    /// Remove the listener for `(channel, topic)`. Returns whether one existed.
    pub fn unregister(&self, channel: Channel, topic: &str) -> bool {
        self.write_listeners()
            .remove(&(channel, topic.to_string()))
            .is_some()
    }

    fn listener(&self, channel: Channel, topic: &str) -> Option<Listener> {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.get(&(channel, topic.to_string())).cloned()
    }

    fn write_listeners(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<(Channel, String), Listener>> {
        match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────

    /// Publish a document update.
    ///
    /// Small updates travel inline, sealed when a group key is configured.
    /// Larger ones are stored as a blob and announced by name.
    pub async fn publish_update(&self, topic: &str, content: impl Into<Bytes>) -> Result<Name> {
        let content = content.into();
        let wire = if content.len() <= self.config.max_inline_size {
            Envelope::new(Channel::Update, topic, content).encode(self.group_key.as_ref())?
        } else {
            let blob = self
                .publish_blob(UPDATE_SEGMENTS_TOPIC, content, None, false)
                .await?;
            Envelope::new(Channel::BlobUpdate, topic, blob.encode()).encode(None)?
        };
        Ok(self.at_least_once.produce(wire).await?)
    }

    /// Store `content` as a segmented blob and optionally announce it.
    ///
    /// Without a `name` a random one under the application prefix is used.
    pub async fn publish_blob(
        &self,
        topic: &str,
        content: impl Into<Bytes>,
        name: Option<Name>,
        push: bool,
    ) -> Result<Name> {
        let content = content.into();
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => self.config.namespace.gen_blob_name(&self.app_prefix),
        };

        self.persistent
            .set(&name.to_string(), Some(content.clone()))
            .await?;
        for segment in self.segment(&name, &content)? {
            self.persistent.put_item(&segment).await?;
        }
        tracing::debug!(%name, size = content.len(), "blob stored");

        if push {
            let wire = Envelope::new(Channel::Blob, topic, name.encode()).encode(None)?;
            self.at_least_once.produce(wire).await?;
        }
        Ok(name)
    }

    /// Split `content` into signed `<name>/seg=N` items.
    fn segment(&self, name: &Name, content: &Bytes) -> Result<Vec<NamedItem>> {
        let size = self.config.segment_size.clamp(1, MAX_SEGMENT_SIZE);
        let count = content.len().div_ceil(size).max(1);
        let last = (count - 1) as u64;
        (0..count)
            .map(|i| -> Result<NamedItem> {
                let chunk = content.slice((i * size).min(content.len())..((i + 1) * size).min(content.len()));
                let mut item = NamedItem::new(name.append(Component::segment(i as u64)), chunk)
                    .with_freshness(self.config.delivery.freshness)
                    .with_final_block(last);
                self.signer.sign(&mut item)?;
                Ok(item)
            })
            .collect()
    }

    /// Publish the newest status for `topic`.
    pub async fn publish_status(&self, topic: &str, content: impl Into<Bytes>) -> Result<Name> {
        let content = content.into();
        if content.len() > self.config.max_inline_size {
            tracing::error!(
                topic,
                size = content.len(),
                "status too large for one item; use the blob channel"
            );
        }
        let wire = Envelope::new(Channel::Status, topic, content).encode(None)?;
        Ok(self.latest_only.produce(wire).await?)
    }

    /// A bundler whose merged output is published as updates on `topic`.
    pub fn bundled_updates(self: &Arc<Self>, topic: &str, merge: Merge, config: BundlerConfig) -> Bundler {
        let agent = Arc::downgrade(self);
        let topic = topic.to_string();
        let emit: Emit = Arc::new(move |payload| {
            let agent = agent.clone();
            let topic = topic.clone();
            Box::pin(async move {
                let Some(agent) = agent.upgrade() else {
                    return;
                };
                if let Err(e) = agent.publish_update(&topic, payload).await {
                    tracing::error!(topic, error = %e, "failed to publish bundled update");
                }
            })
        });
        Bundler::new(merge, emit, config)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Blobs
    // ─────────────────────────────────────────────────────────────────────

    /// The blob (or single segment) named `name`, fetching it when it is
    /// not stored locally. `None` when it cannot be retrieved.
    pub async fn get_blob(&self, name: &Name) -> Result<Option<Bytes>> {
        if let Some(blob) = self.persistent.get(&name.to_string()).await? {
            return Ok(Some(blob));
        }
        match self.fetch_blob(name).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) => {
                tracing::warn!(%name, error = %e, "unable to fetch blob");
                Ok(None)
            }
        }
    }

    /// Fetch every segment of `name`, caching each one and the reassembled
    /// blob.
    async fn fetch_blob(&self, name: &Name) -> Result<Bytes> {
        let mut segments = SegmentFetcher::new(
            Arc::clone(&self.transport),
            name.clone(),
            Arc::clone(&self.verifier),
        )
        .convention(Convention::Segment)
        .range(0, None)
        .policy(self.config.blob_fetch.clone())
        .cancel(self.cancel.child_token())
        .start();

        let mut parts = BTreeMap::new();
        while let Some(result) = segments.recv().await {
            let item = result?;
            self.persistent.put_item(&item).await?;
            if let Some(index) = item.name.segment() {
                parts.insert(index, item.content);
            }
        }

        let mut blob = BytesMut::with_capacity(parts.values().map(Bytes::len).sum());
        for part in parts.into_values() {
            blob.extend_from_slice(&part);
        }
        let blob = blob.freeze();
        self.persistent
            .set(&name.to_string(), Some(blob.clone()))
            .await?;
        tracing::debug!(%name, size = blob.len(), "blob fetched");
        Ok(blob)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    async fn on_update(self: Arc<Self>, wire: Bytes, name: Name) {
        if !self.is_ready() {
            fatal(format_args!(
                "update {name} dispatched before the sync agent is ready"
            ));
        }
        if wire.is_empty() {
            return;
        }
        let Some(envelope) = self.open(&wire, &name) else {
            return;
        };

        match envelope.channel {
            Channel::BlobUpdate => {
                let value = self.resolve_blob_update(&envelope, &name).await;
                match self.listener(Channel::Update, &envelope.topic) {
                    Some(listener) => listener(value, name),
                    None => tracing::error!(
                        topic = %envelope.topic,
                        "execution order violation: update listener must be registered before the first update"
                    ),
                }
            }
            channel => {
                if channel == Channel::Blob {
                    self.spawn_blob_fetch(&envelope.content);
                }
                match self.listener(channel, &envelope.topic) {
                    Some(listener) => listener(envelope.content, name),
                    None if channel == Channel::Update => tracing::error!(
                        topic = %envelope.topic,
                        "execution order violation: update listener must be registered before the first update"
                    ),
                    None => {}
                }
            }
        }
    }

    fn open(&self, wire: &[u8], name: &Name) -> Option<Envelope> {
        match Envelope::decode(wire, self.group_key.as_ref()) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::error!(
                    %name,
                    error = %e,
                    "dropping malformed envelope; this node may be out of sync"
                );
                None
            }
        }
    }

    /// Retrieve the update carried by a `blobUpdate`. Failure is fatal.
    async fn resolve_blob_update(&self, envelope: &Envelope, name: &Name) -> Bytes {
        let blob_name = match Name::decode(&envelope.content) {
            Ok(blob_name) => blob_name,
            Err(e) => fatal(format_args!("blobUpdate {name} carries no blob name: {e}")),
        };
        match self.get_blob(&blob_name).await {
            Ok(Some(value)) => value,
            Ok(None) => fatal(format_args!("unable to retrieve update blob {blob_name}")),
            Err(e) => fatal(format_args!("unable to read update blob {blob_name}: {e}")),
        }
    }

    fn spawn_blob_fetch(self: &Arc<Self>, encoded_name: &Bytes) {
        let blob_name = match Name::decode(encoded_name) {
            Ok(blob_name) => blob_name,
            Err(e) => {
                tracing::error!(error = %e, "invalid blob name");
                return;
            }
        };
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            match agent.persistent.has(&blob_name.to_string()).await {
                Ok(true) => {}
                _ => {
                    if let Err(e) = agent.fetch_blob(&blob_name).await {
                        tracing::warn!(name = %blob_name, error = %e, "background blob fetch failed");
                    }
                }
            }
        });
    }

    /// Answer a request from local storage.
    pub async fn serve(&self, name: &Name) -> Option<NamedItem> {
        let namespace = &self.config.namespace;
        if name.len() <= self.app_prefix.len() + 1 {
            return None;
        }
        if name.get(self.app_prefix.len()) == Some(&namespace.sync_keyword) {
            return None;
        }

        let latest = name.len() >= 2 && name.get(name.len() - 2) == Some(&namespace.latest_only_keyword);
        let stored = if latest {
            self.temporary.get(&namespace.latest_only_key(name)).await
        } else {
            self.persistent.get(&name.to_string()).await
        };
        let wire = match stored {
            Ok(Some(wire)) if !wire.is_empty() => wire,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(%name, error = %e, "storage lookup failed");
                return None;
            }
        };

        match NamedItem::decode(&wire) {
            Ok(item) if latest && item.name != *name => None,
            Ok(item) => Some(item),
            Err(e) => {
                tracing::error!(%name, error = %e, "stored data is not decodable");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replay and state
    // ─────────────────────────────────────────────────────────────────────

    /// Feed the `update` listener of `topic` every stored update after
    /// `start_from`.
    pub async fn replay_updates(self: &Arc<Self>, topic: &str, start_from: Option<&StateVector>) -> Result<()> {
        let listener = self.listener(Channel::Update, topic).ok_or_else(|| {
            AgentError::Misuse(format!("replay_updates for {topic} without an update listener"))
        })?;
        let start = start_from.cloned().unwrap_or_default();

        let agent = Arc::clone(self);
        let topic = topic.to_string();
        let callback: UpdateEvent = Arc::new(move |wire, name| {
            let agent = Arc::clone(&agent);
            let listener = Arc::clone(&listener);
            let topic = topic.clone();
            Box::pin(async move {
                let Some(envelope) = agent.open(&wire, &name) else {
                    return;
                };
                if envelope.topic != topic {
                    return;
                }
                match envelope.channel {
                    Channel::Update => listener(envelope.content, name),
                    Channel::BlobUpdate => {
                        let value = agent.resolve_blob_update(&envelope, &name).await;
                        listener(value, name);
                    }
                    _ => {}
                }
            })
        });
        self.at_least_once.replay(&start, callback).await;
        Ok(())
    }

    /// Checkpoint of delivered updates, usable as `start_from` for replay.
    pub async fn update_sync_state(&self) -> StateVector {
        self.at_least_once.watermark().await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    async fn on_reset_triggered(&self) {
        if let Some(hook) = &self.on_reset {
            hook();
        }
        self.reset().await;
    }

    /// Send a gossip round on both deliveries now.
    pub fn fire(&self) {
        self.at_least_once.fire();
        self.latest_only.fire();
    }

    /// Restart gossip on both deliveries from their persisted state.
    pub async fn reset(&self) {
        if let Err(e) = self.at_least_once.reset().await {
            tracing::error!(error = %e, "at-least-once reset failed");
        }
        if let Err(e) = self.latest_only.reset().await {
            tracing::error!(error = %e, "latest-only reset failed");
        }
    }

    /// Stop everything. Delivery state is flushed to storage.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        self.at_least_once.destroy().await;
        self.latest_only.destroy().await;
        let producers = std::mem::take(&mut *self.lock_producers());
        for producer in producers {
            producer.close();
        }
        tracing::info!(node = %self.node_id, "sync agent destroyed");
    }
}

/// Answers requests under the application prefix.
struct ServeHandler {
    agent: Weak<SyncAgent>,
}

#[async_trait]
impl Handler for ServeHandler {
    async fn handle(&self, interest: &Interest) -> Option<NamedItem> {
        let agent = self.agent.upgrade()?;
        agent.serve(&interest.name).await
    }
}

/// Registered only to announce a prefix.
struct Silent;

#[async_trait]
impl Handler for Silent {
    async fn handle(&self, _interest: &Interest) -> Option<NamedItem> {
        None
    }
}
