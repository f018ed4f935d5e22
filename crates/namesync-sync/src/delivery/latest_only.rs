//! Latest-only delivery.
//!
//! Only the newest item of each producer is fetched. Skipped sequences are
//! never fetched, so the watermark simply tracks the highest sequence seen.

use std::sync::Arc;

use bytes::Bytes;
use namesync_core::{Name, NamedItem, StateVector, SyncUpdate};
use namesync_store::Storage;

use super::{DeliveryCore, DeliveryParams, Phase, UpdateEvent};
use crate::endpoint::{consume, ConsumeOptions};
use crate::error::Result;

/// Newest-value delivery with a transient item cache.
pub struct LatestOnlyDelivery {
    core: DeliveryCore,
    packets: Arc<dyn Storage>,
}

impl LatestOnlyDelivery {
    /// Create the delivery and open its first gossip epoch.
    ///
    /// Items are cached in `packets`; the watermark goes to `state`.
    pub async fn create(
        params: DeliveryParams,
        packets: Arc<dyn Storage>,
        state: Arc<dyn Storage>,
    ) -> Result<Arc<Self>> {
        let core = DeliveryCore::new(params, state).await;
        let this = Arc::new(Self { core, packets });

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

    pub async fn watermark(&self) -> StateVector {
        self.core.watermark().await
    }

    pub fn set_seq_num(&self, seq: u64) -> Result<()> {
        self.core.node()?.set_seq_num(seq);
        Ok(())
    }

    /// Publish `content` as this node's newest value.
    pub async fn produce(&self, content: Bytes) -> Result<Name> {
        let node = self.core.node()?;
        let seq = node.reserve_next();
        let name = self.core.namespace.sequence_name(&self.core.base_name, seq);

        let mut item = NamedItem::new(name.clone(), content).with_freshness(self.core.config.freshness);
        self.core.signer.sign(&mut item)?;
        let key = self.core.namespace.latest_only_key(&name);
        self.packets.set(&key, Some(item.encode())).await?;
        self.core.mark_own(seq).await?;

        node.announce(seq);
        tracing::debug!(%name, "produced latest");
        Ok(name)
    }

    /// Cached newest item of the producer whose base name is `base`.
    pub async fn latest(&self, base: &Name) -> Result<Option<NamedItem>> {
        let key = base.to_string();
        match self.packets.get(&key).await? {
            Some(bytes) => Ok(Some(NamedItem::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch the newest item named by `update.hi`. Failures are dropped.
    pub async fn handle_sync_update(self: Arc<Self>, update: SyncUpdate) {
        if update.hi <= self.core.watermark.lock().await.get(&update.id) {
            return;
        }
        let Some(callback) = self.core.on_update() else {
            return;
        };

        let name = self
            .core
            .namespace
            .sequence_name(&self.core.base_for(&update.id), update.hi);
        let opts = ConsumeOptions::new(Arc::clone(&self.core.verifier))
            .with_retx_limit(self.core.config.latest_retx_limit)
            .with_lifetime(self.core.config.latest_lifetime)
            .with_cancel(self.core.epoch_token().child_token());

        let item = match consume(self.core.transport.as_ref(), name.clone(), &opts).await {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(%name, error = %e, "dropping latest-only update");
                return;
            }
        };

        let key = self.core.namespace.latest_only_key(&item.name);
        if let Err(e) = self.packets.set(&key, Some(item.encode())).await {
            tracing::warn!(%name, error = %e, "failed to cache latest item");
        }

        {
            let mut watermark = self.core.watermark.lock().await;
            if watermark.raise(&update.id, update.hi) {
                if let Err(e) = self.core.persist_watermark(&watermark).await {
                    tracing::error!(id = %update.id, error = %e, "failed to persist watermark");
                }
            }
        }

        tokio::spawn(callback(item.content, item.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::{FnHandler, Interest, Transport};
    use namesync_core::{DigestSigning, Signer};
    use namesync_store::MemoryStorage;
    use tokio::sync::mpsc;

    fn n(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    async fn delivery(network: &Arc<MemoryNetwork>, node: &str) -> (Arc<LatestOnlyDelivery>, mpsc::UnboundedReceiver<Bytes>) {
        let params = DeliveryParams::new(
            n(node),
            n("/app/32=sync/32=late"),
            Arc::new(network.create_transport()),
            Arc::new(DigestSigning),
            Arc::new(DigestSigning),
        );
        let delivery = LatestOnlyDelivery::create(
            params,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        )
        .await
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        delivery
            .set_on_update(Arc::new(move |content, _name| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(content);
                })
            }))
            .unwrap();
        delivery.start().unwrap();
        (delivery, rx)
    }

    #[tokio::test]
    async fn test_produce_overwrites_cached_value() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = delivery(&network, "/app/alice").await;

        alice.produce(Bytes::from_static(b"online")).await.unwrap();
        let name = alice.produce(Bytes::from_static(b"away")).await.unwrap();
        assert_eq!(name.sequence(), Some(2));

        let cached = alice.latest(alice.core().base_name()).await.unwrap().unwrap();
        assert_eq!(cached.content.as_ref(), b"away");
        assert_eq!(cached.name, name);
        assert_eq!(alice.watermark().await.get(&n("/app/alice")), 2);
        alice.destroy().await;
    }

    #[tokio::test]
    async fn test_fetches_only_highest() {
        let network = MemoryNetwork::new();
        let producer = network.create_transport();
        let _p = producer
            .produce(
                n("/app/carol/32=sync/32=late"),
                Arc::new(FnHandler(|interest: Interest| async move {
                    if interest.name.sequence() != Some(5) {
                        return None;
                    }
                    let mut item = NamedItem::new(interest.name, &b"five"[..]);
                    DigestSigning.sign(&mut item).ok()?;
                    Some(item)
                })),
            )
            .await
            .unwrap();

        let (bob, mut rx) = delivery(&network, "/app/bob").await;
        let carol = n("/app/carol");
        Arc::clone(&bob)
            .handle_sync_update(SyncUpdate::new(carol.clone(), 1, 5))
            .await;
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"five");
        assert_eq!(bob.watermark().await.get(&carol), 5);

        // Stale update is skipped without fetching.
        Arc::clone(&bob)
            .handle_sync_update(SyncUpdate::new(carol.clone(), 1, 4))
            .await;
        assert_eq!(bob.watermark().await.get(&carol), 5);
        assert!(rx.try_recv().is_err());
        bob.destroy().await;
    }

    #[tokio::test]
    async fn test_failure_is_dropped_without_reset() {
        let network = MemoryNetwork::new();
        let (bob, mut rx) = delivery(&network, "/app/bob").await;
        let carol = n("/app/carol");

        Arc::clone(&bob)
            .handle_sync_update(SyncUpdate::new(carol.clone(), 1, 3))
            .await;
        assert_eq!(bob.watermark().await.get(&carol), 0);
        assert_eq!(bob.phase(), Phase::Running);
        assert!(rx.try_recv().is_err());
        bob.destroy().await;
    }
}
