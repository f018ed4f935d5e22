//! At-least-once delivery.
//!
//! Every fetched item is persisted before the callback runs, and the
//! watermark only moves across contiguous runs of stored items. Whatever
//! lies above the watermark is fetched and delivered again after a restart
//! or reset, so callbacks must tolerate repeats.

use std::sync::Arc;

use bytes::Bytes;
use namesync_core::{fatal, Name, NamedItem, StateVector, SyncUpdate};
use namesync_store::{Storage, StorageExt};
use tokio_util::sync::CancellationToken;

use super::{DeliveryCore, DeliveryParams, Phase, UpdateEvent};
use crate::error::{Result, SyncError};
use crate::fetch::{Convention, SegmentFetcher};

/// Ordered-with-gap-tolerance delivery over a persistent store.
pub struct AtLeastOnceDelivery {
    core: DeliveryCore,
    storage: Arc<dyn Storage>,
}

impl AtLeastOnceDelivery {
    /// Create the delivery and open its first gossip epoch.
    ///
    /// Items and the watermark both live in `storage`.
    pub async fn create(params: DeliveryParams, storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        let core = DeliveryCore::new(params, Arc::clone(&storage)).await;
        let this = Arc::new(Self { core, storage });

        let weak = Arc::downgrade(&this);
        this.core.set_dispatch(Arc::new(move |update| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(this.handle_sync_update(update));
            }
        }));
        this.core.init().await?;
        Ok(this)
    }

    pub fn core(&self) -> &DeliveryCore {
        &self.core
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn set_on_update(&self, callback: UpdateEvent) -> Result<()> {
        self.core.set_on_update(callback)
    }

    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    pub fn fire(&self) {
        self.core.fire();
    }

    pub async fn reset(&self) -> Result<()> {
        self.core.reset().await
    }

    pub async fn destroy(&self) {
        self.core.destroy().await;
    }

    /// Snapshot of the delivered watermark.
    pub async fn watermark(&self) -> StateVector {
        self.core.watermark().await
    }

    /// Move this node's reservation counter.
    pub fn set_seq_num(&self, seq: u64) -> Result<()> {
        self.core.node()?.set_seq_num(seq);
        Ok(())
    }

    /// Publish `content` as this node's next sequence item.
    pub async fn produce(&self, content: Bytes) -> Result<Name> {
        let node = self.core.node()?;
        let seq = node.reserve_next();
        let name = self.core.namespace.sequence_name(&self.core.base_name, seq);

        let mut item = NamedItem::new(name.clone(), content).with_freshness(self.core.config.freshness);
        self.core.signer.sign(&mut item)?;
        self.storage.put_item(&item).await?;
        self.core.mark_own(seq).await?;

        node.announce(seq);
        tracing::debug!(%name, "produced");
        Ok(name)
    }

    /// Fetch and deliver the range, then advance the watermark if the range
    /// closes a gap.
    pub async fn handle_sync_update(self: Arc<Self>, update: SyncUpdate) {
        let cancel = self.core.epoch_token();
        if let Err(e) = self.deliver_range(&update, &cancel).await {
            if !self.core.is_running() || cancel.is_cancelled() {
                return;
            }
            tracing::error!(
                id = %update.id,
                lo = update.lo,
                hi = update.hi,
                error = %e,
                "failed to deliver range"
            );
            tracing::warn!(prefix = %self.core.sync_prefix, "aborting gossip after delivery failure");
            self.core.abort_epoch();
            match self.core.reset_hook() {
                Some(hook) => hook(),
                None => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.core.reset().await {
                            tracing::error!(error = %e, "reset failed");
                        }
                    });
                }
            }
            return;
        }

        if let Err(e) = self.advance_watermark(&update).await {
            tracing::error!(id = %update.id, error = %e, "failed to advance watermark");
        }
    }

    async fn deliver_range(&self, update: &SyncUpdate, cancel: &CancellationToken) -> Result<()> {
        let callback = self
            .core
            .on_update()
            .ok_or_else(|| SyncError::Misuse("no update callback".into()))?;

        let mut items = SegmentFetcher::new(
            Arc::clone(&self.core.transport),
            self.core.base_for(&update.id),
            Arc::clone(&self.core.verifier),
        )
        .convention(Convention::Sequence)
        .range(update.lo, Some(update.hi))
        .policy(self.core.config.fetch.clone())
        .cancel(cancel.clone())
        .start();

        while let Some(result) = items.recv().await {
            let item = result?;
            self.storage.put_item(&item).await?;
            callback(item.content.clone(), item.name.clone()).await;
        }
        Ok(())
    }

    async fn advance_watermark(&self, update: &SyncUpdate) -> Result<()> {
        let last_seen = {
            let mut last = self.core.lock_last_till_now();
            last.raise(&update.id, update.hi);
            last.get(&update.id)
        };

        let mut watermark = self.core.watermark.lock().await;
        let front = watermark.get(&update.id);
        if update.lo > front + 1 {
            return Ok(());
        }

        let base = self.core.base_for(&update.id);
        let mut reached = update.hi;
        while reached < last_seen {
            let next = self.core.namespace.sequence_name(&base, reached + 1);
            if !self.storage.has(&next.to_string()).await? {
                break;
            }
            reached += 1;
        }

        if reached > front {
            watermark.set(update.id.clone(), reached);
            self.core.persist_watermark(&watermark).await?;
            tracing::trace!(id = %update.id, watermark = reached, "advanced");
        }
        Ok(())
    }

    /// Re-deliver stored items above `start_from` up to the watermark.
    ///
    /// A missing item below the watermark means local storage lost data
    /// this node already acknowledged; that is fatal.
    pub async fn replay(&self, start_from: &StateVector, callback: UpdateEvent) {
        let watermark = self.core.watermark().await;
        for (id, hi) in watermark.iter() {
            let base = self.core.base_for(id);
            for seq in start_from.get(id) + 1..=hi {
                let name = self.core.namespace.sequence_name(&base, seq);
                match self.storage.get_item(&name).await {
                    Ok(Some(item)) => callback(item.content, item.name).await,
                    Ok(None) => fatal(format_args!("replay: {name} missing below watermark")),
                    Err(e) => fatal(format_args!("replay: cannot read {name}: {e}")),
                }
            }
        }
    }
}
