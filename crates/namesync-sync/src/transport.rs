//! Name-based transport abstraction.
//!
//! Requests ([`Interest`]s) carry a name; producers register a name prefix
//! and a [`Handler`] that may answer with a [`NamedItem`]. Sync traffic is
//! sent with [`Transport::multicast`], which reaches every producer for the
//! prefix without waiting for an answer.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use namesync_core::{Name, NamedItem};

use crate::error::TransportError;

/// Default lifetime of a request.
pub const DEFAULT_INTEREST_LIFETIME: Duration = Duration::from_secs(4);

/// A request for a named item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub name: Name,
    /// Opaque parameters carried with the request.
    pub app_parameters: Option<Bytes>,
    pub lifetime: Duration,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            app_parameters: None,
            lifetime: DEFAULT_INTEREST_LIFETIME,
        }
    }

    pub fn with_app_parameters(mut self, params: Bytes) -> Self {
        self.app_parameters = Some(params);
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

/// Answers requests under a registered prefix.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Return the item for `interest`, or `None` to stay silent.
    async fn handle(&self, interest: &Interest) -> Option<NamedItem>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Interest) -> Fut + Send + Sync,
    Fut: Future<Output = Option<NamedItem>> + Send,
{
    async fn handle(&self, interest: &Interest) -> Option<NamedItem> {
        (self.0)(interest.clone()).await
    }
}

/// A registered prefix. Unregisters when closed or dropped.
pub struct Producer {
    prefix: Name,
    unregister: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Producer {
    pub fn new(prefix: Name, unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            prefix,
            unregister: Mutex::new(Some(Box::new(unregister))),
        }
    }

    pub fn prefix(&self) -> &Name {
        &self.prefix
    }

    /// Stop answering requests. Idempotent.
    pub fn close(&self) {
        let unregister = match self.unregister.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(unregister) = unregister {
            unregister();
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").field("prefix", &self.prefix).finish()
    }
}

/// Transport trait for expressing requests and registering producers.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for one matching item.
    async fn express(&self, interest: Interest) -> Result<NamedItem, TransportError>;

    /// Send a request to every producer for its name without waiting.
    async fn multicast(&self, interest: Interest) -> Result<(), TransportError>;

    /// Register `handler` for requests under `prefix`.
    async fn produce(
        &self,
        prefix: Name,
        handler: Arc<dyn Handler>,
    ) -> Result<Producer, TransportError>;

    /// Identifier of this endpoint on the network.
    fn face_id(&self) -> u64;
}

/// An in-memory network for tests.
///
/// Every [`MemoryTransport`] is a face. Requests go to producers on other
/// faces whose prefix matches the name. The face announcing the longest
/// matching prefix is asked first, and all of its matching producers are
/// tried before moving on; a silent producer passes the request to the next
/// one. Multicast reaches the longest matching producer of every face.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::RwLock;

    struct Route {
        id: u64,
        face: u64,
        prefix: Name,
        handler: Arc<dyn Handler>,
    }

    /// Shared routing table of an in-memory network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        routes: RwLock<Vec<Route>>,
        next_face: AtomicU64,
        next_route: AtomicU64,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport attached to this network on a fresh face.
        pub fn create_transport(self: &Arc<Self>) -> MemoryTransport {
            MemoryTransport {
                face: self.next_face.fetch_add(1, Ordering::Relaxed) + 1,
                network: Arc::clone(self),
                closed: AtomicBool::new(false),
            }
        }

        /// Number of registered prefixes.
        pub fn route_count(&self) -> usize {
            self.routes.read().map(|r| r.len()).unwrap_or(0)
        }

        /// Handlers matching `name` on faces other than `from`, grouped by
        /// face. Faces are ordered by their longest matching prefix; within
        /// a face, longer prefixes come first.
        fn matching(&self, name: &Name, from: u64) -> Vec<Vec<Arc<dyn Handler>>> {
            let routes = match self.routes.read() {
                Ok(routes) => routes,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut matches: Vec<&Route> = routes
                .iter()
                .filter(|r| r.face != from && r.prefix.is_prefix_of(name))
                .collect();
            matches.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

            let mut faces: Vec<(u64, Vec<Arc<dyn Handler>>)> = Vec::new();
            for route in matches {
                match faces.iter_mut().find(|(face, _)| *face == route.face) {
                    Some((_, handlers)) => handlers.push(Arc::clone(&route.handler)),
                    None => faces.push((route.face, vec![Arc::clone(&route.handler)])),
                }
            }
            faces.into_iter().map(|(_, handlers)| handlers).collect()
        }

        fn register(&self, face: u64, prefix: Name, handler: Arc<dyn Handler>) -> u64 {
            let id = self.next_route.fetch_add(1, Ordering::Relaxed);
            let mut routes = match self.routes.write() {
                Ok(routes) => routes,
                Err(poisoned) => poisoned.into_inner(),
            };
            routes.push(Route {
                id,
                face,
                prefix,
                handler,
            });
            id
        }

        fn unregister(&self, id: u64) {
            let mut routes = match self.routes.write() {
                Ok(routes) => routes,
                Err(poisoned) => poisoned.into_inner(),
            };
            routes.retain(|r| r.id != id);
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        face: u64,
        network: Arc<MemoryNetwork>,
        closed: AtomicBool,
    }

    impl MemoryTransport {
        /// Stop sending. Registered producers stay until closed by their owners.
        pub fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn check_open(&self) -> Result<(), TransportError> {
            if self.closed.load(Ordering::Acquire) {
                Err(TransportError::Closed)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn express(&self, interest: Interest) -> Result<NamedItem, TransportError> {
            self.check_open()?;
            let handlers: Vec<_> = self
                .network
                .matching(&interest.name, self.face)
                .into_iter()
                .flatten()
                .collect();
            if handlers.is_empty() {
                return Err(TransportError::NoRoute(interest.name.to_string()));
            }

            let attempt = async {
                for handler in handlers {
                    if let Some(item) = handler.handle(&interest).await {
                        if interest.name.is_prefix_of(&item.name) {
                            return Some(item);
                        }
                        tracing::debug!(
                            requested = %interest.name,
                            answered = %item.name,
                            "dropping mismatched answer"
                        );
                    }
                }
                None
            };

            match tokio::time::timeout(interest.lifetime, attempt).await {
                Ok(Some(item)) => Ok(item),
                _ => Err(TransportError::Timeout(interest.name.to_string())),
            }
        }

        async fn multicast(&self, interest: Interest) -> Result<(), TransportError> {
            self.check_open()?;
            let faces = self.network.matching(&interest.name, self.face);
            for handler in faces.into_iter().filter_map(|h| h.into_iter().next()) {
                let interest = interest.clone();
                tokio::spawn(async move {
                    handler.handle(&interest).await;
                });
            }
            Ok(())
        }

        async fn produce(
            &self,
            prefix: Name,
            handler: Arc<dyn Handler>,
        ) -> Result<Producer, TransportError> {
            self.check_open()?;
            let id = self.network.register(self.face, prefix.clone(), handler);
            let network = Arc::downgrade(&self.network);
            Ok(Producer::new(prefix, move || {
                if let Some(network) = network.upgrade() {
                    network.unregister(id);
                }
            }))
        }

        fn face_id(&self) -> u64 {
            self.face
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;

    fn n(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    fn fixed(content: &'static str) -> Arc<dyn Handler> {
        Arc::new(FnHandler(move |interest: Interest| async move {
            Some(NamedItem::new(interest.name, content.as_bytes()))
        }))
    }

    fn silent() -> Arc<dyn Handler> {
        Arc::new(FnHandler(|_: Interest| async { None::<NamedItem> }))
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let network = MemoryNetwork::new();
        let a = network.create_transport();
        let b = network.create_transport();
        let c = network.create_transport();

        let _short = b.produce(n("/app"), fixed("short")).await.unwrap();
        let _long = c.produce(n("/app/alice"), fixed("long")).await.unwrap();

        let item = a.express(Interest::new(n("/app/alice/seq=1"))).await.unwrap();
        assert_eq!(item.content.as_ref(), b"long");

        let item = a.express(Interest::new(n("/app/bob/seq=1"))).await.unwrap();
        assert_eq!(item.content.as_ref(), b"short");
    }

    #[tokio::test]
    async fn test_falls_back_to_shorter_prefix() {
        let network = MemoryNetwork::new();
        let a = network.create_transport();
        let b = network.create_transport();
        let c = network.create_transport();

        let _short = b.produce(n("/app"), fixed("replica")).await.unwrap();
        let _long = c.produce(n("/app/alice"), silent()).await.unwrap();

        let item = a.express(Interest::new(n("/app/alice/seq=1"))).await.unwrap();
        assert_eq!(item.content.as_ref(), b"replica");
    }

    #[tokio::test]
    async fn test_face_with_longer_prefix_is_asked_first() {
        let network = MemoryNetwork::new();
        let a = network.create_transport();
        let replica = network.create_transport();
        let origin = network.create_transport();

        let _r = replica.produce(n("/app"), fixed("replica")).await.unwrap();
        let _serve = origin.produce(n("/app"), fixed("origin")).await.unwrap();
        let _attract = origin.produce(n("/app/carol"), silent()).await.unwrap();

        let item = a.express(Interest::new(n("/app/carol/seq=1"))).await.unwrap();
        assert_eq!(item.content.as_ref(), b"origin");
    }

    #[tokio::test]
    async fn test_no_route_and_own_face_skipped() {
        let network = MemoryNetwork::new();
        let a = network.create_transport();
        let _own = a.produce(n("/app"), fixed("self")).await.unwrap();

        let err = a.express(Interest::new(n("/app/x"))).await.unwrap_err();
        assert!(matches!(err, TransportError::NoRoute(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_producer_close_unregisters() {
        let network = MemoryNetwork::new();
        let a = network.create_transport();
        let b = network.create_transport();

        let producer = b.produce(n("/app"), fixed("x")).await.unwrap();
        assert_eq!(network.route_count(), 1);
        producer.close();
        producer.close();
        assert_eq!(network.route_count(), 0);
        assert!(a.express(Interest::new(n("/app/x"))).await.is_err());

        drop(b.produce(n("/app"), fixed("x")).await.unwrap());
        assert_eq!(network.route_count(), 0);
    }

    #[tokio::test]
    async fn test_multicast_reaches_every_other_face() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let faces: Vec<_> = (0..3).map(|_| network.create_transport()).collect();

        let mut producers = Vec::new();
        for (i, face) in faces.iter().enumerate() {
            let tx = tx.clone();
            let handler = Arc::new(FnHandler(move |_: Interest| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(i);
                    None::<NamedItem>
                }
            }));
            producers.push(face.produce(n("/app/32=sync"), handler).await.unwrap());
        }

        faces[0].multicast(Interest::new(n("/app/32=sync/v=3"))).await.unwrap();
        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_closed_transport() {
        let network = MemoryNetwork::new();
        let a = network.create_transport();
        a.close();
        assert_eq!(
            a.express(Interest::new(n("/x"))).await.unwrap_err(),
            TransportError::Closed
        );
    }
}
