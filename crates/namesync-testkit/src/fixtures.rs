//! Test fixtures and helpers.
//!
//! Common setup code for multi-node integration tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use namesync_core::{Ed25519Signer, Ed25519Verifier, Keypair, Name, NamedItem, Signer};
use namesync_store::{MemoryStorage, Storage, StorageExt};
use namesync_sync::{FnHandler, Interest, MemoryNetwork, Producer, Transport, UpdateEvent};
use tokio::sync::mpsc;

/// A participant: node id, signing key and persistent storage.
pub struct TestFixture {
    pub node_id: Name,
    pub keypair: Keypair,
    pub storage: Arc<MemoryStorage>,
}

impl TestFixture {
    /// Create a participant named `node_id` with a random keypair.
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: parse(node_id),
            keypair: Keypair::generate(),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Create with a deterministic keypair from seed.
    pub fn with_seed(node_id: &str, seed: [u8; 32]) -> Self {
        Self {
            node_id: parse(node_id),
            keypair: Keypair::from_seed(&seed),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Name under which this participant's key is published.
    pub fn key_name(&self) -> Name {
        self.node_id.append(namesync_core::Component::keyword("key"))
    }

    pub fn signer(&self) -> Arc<Ed25519Signer> {
        Arc::new(Ed25519Signer::new(self.keypair.clone(), self.key_name()))
    }

    /// Build and sign an item.
    pub fn make_item(&self, name: &Name, content: &[u8]) -> NamedItem {
        let mut item = NamedItem::new(name.clone(), content.to_vec());
        // Ed25519 signing has no failure path.
        let _ = self.signer().sign(&mut item);
        item
    }
}

/// Create participants `<app>/node0 .. <app>/node{count-1}` with
/// deterministic keys.
pub fn multi_party_fixtures(app: &str, count: usize) -> Vec<TestFixture> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8;
            TestFixture::with_seed(&format!("{app}/node{i}"), seed)
        })
        .collect()
}

/// A verifier that trusts every fixture's key.
pub fn trusting_verifier(parties: &[&TestFixture]) -> Arc<Ed25519Verifier> {
    let verifier = parties.iter().fold(Ed25519Verifier::new(), |v, p| {
        v.trust(p.key_name(), p.keypair.public_key())
    });
    Arc::new(verifier)
}

/// An in-memory network shared by every node of a test.
pub struct TestNetwork {
    pub network: Arc<MemoryNetwork>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
        }
    }

    /// A fresh face on the network.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.network.create_transport())
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves items from a storage under a prefix, the way a repository or a
/// peer holding copies would.
pub struct Responder {
    producer: Producer,
}

impl Responder {
    /// Answer requests under `prefix` with exact-name lookups in `storage`.
    pub async fn serve(network: &TestNetwork, prefix: Name, storage: Arc<dyn Storage>) -> Self {
        let transport = network.network.create_transport();
        let handler = FnHandler(move |interest: Interest| {
            let storage = Arc::clone(&storage);
            async move {
                match storage.get_item(&interest.name).await {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!(name = %interest.name, error = %e, "responder lookup failed");
                        None
                    }
                }
            }
        });
        let producer = match transport.produce(prefix, Arc::new(handler)).await {
            Ok(producer) => producer,
            Err(e) => panic!("memory transport refused registration: {e}"),
        };
        Self { producer }
    }

    pub fn prefix(&self) -> &Name {
        self.producer.prefix()
    }

    pub fn close(&self) {
        self.producer.close();
    }
}

/// Put a signed item into `storage` under its name.
pub async fn store_item(storage: &dyn Storage, item: &NamedItem) {
    if let Err(e) = storage.put_item(item).await {
        panic!("failed to store {}: {e}", item.name);
    }
}

/// An update callback that forwards `(content, name)` into a channel.
pub fn update_channel() -> (UpdateEvent, mpsc::UnboundedReceiver<(Bytes, Name)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: UpdateEvent = Arc::new(move |content, name| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send((content, name));
        })
    });
    (callback, rx)
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Install a test-writer tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn parse(name: &str) -> Name {
    match Name::parse(name) {
        Ok(name) => name,
        Err(e) => panic!("bad fixture name {name}: {e}"),
    }
}
