//! End-to-end agent tests over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use namesync::core::{Name, StateVector, VerifierChain};
use namesync::seal::GroupKey;
use namesync::store::{SqliteStorage, Storage, StorageExt};
use namesync::sync::FetchPolicy;
use namesync::{
    AgentConfig, AgentError, AgentParams, BundlerConfig, Channel, Listener, Merge, SyncAgent,
    MAX_SEGMENT_SIZE,
};
use namesync_testkit::{init_tracing, trusting_verifier, wait_until, TestFixture, TestNetwork};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;

fn n(s: &str) -> Name {
    Name::parse(s).unwrap()
}

fn params(net: &TestNetwork, me: &TestFixture, parties: &[&TestFixture]) -> AgentParams {
    AgentParams::new(
        me.node_id.clone(),
        me.storage.clone(),
        net.transport(),
        me.signer(),
        trusting_verifier(parties),
    )
}

async fn agent(net: &TestNetwork, me: &TestFixture, parties: &[&TestFixture]) -> Arc<SyncAgent> {
    SyncAgent::create(params(net, me, parties)).await.unwrap()
}

fn listener() -> (Listener, UnboundedReceiver<(Bytes, Name)>) {
    let (tx, rx) = unbounded_channel();
    let listener: Listener = Arc::new(move |content, name| {
        let _ = tx.send((content, name));
    });
    (listener, rx)
}

async fn next(rx: &mut UnboundedReceiver<(Bytes, Name)>) -> (Bytes, Name) {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("listener dropped")
}

#[tokio::test]
async fn test_update_reaches_peer() {
    init_tracing();
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let parties = [&alice, &bob];

    let a = agent(&net, &alice, &parties).await;
    let b = agent(&net, &bob, &parties).await;
    let (on_update, mut rx) = listener();
    b.register(Channel::Update, "doc", on_update).unwrap();
    a.set_ready(true).unwrap();
    b.set_ready(true).unwrap();

    let published = a.publish_update("doc", &b"hello"[..]).await.unwrap();
    assert_eq!(published, n("/app/alice/32=sync/32=alo").append(namesync::core::Component::sequence(1)));

    let (content, name) = next(&mut rx).await;
    assert_eq!(content.as_ref(), b"hello");
    assert_eq!(name, published);

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_oversized_update_travels_as_blob() {
    init_tracing();
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let parties = [&alice, &bob];

    let a = agent(&net, &alice, &parties).await;
    let b = agent(&net, &bob, &parties).await;
    let (on_update, mut rx) = listener();
    b.register(Channel::Update, "doc", on_update).unwrap();
    a.set_ready(true).unwrap();
    b.set_ready(true).unwrap();

    let big: Bytes = (0..20_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    a.publish_update("doc", big.clone()).await.unwrap();

    let (content, _) = next(&mut rx).await;
    assert_eq!(content, big);

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_sealed_updates_need_the_group_key() {
    init_tracing();
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let eve = TestFixture::new("/app/eve");
    let parties = [&alice, &bob, &eve];
    let key = GroupKey::generate();

    let a = SyncAgent::create(params(&net, &alice, &parties).with_group_key_bits(key.bits().to_vec()))
        .await
        .unwrap();
    let b = SyncAgent::create(params(&net, &bob, &parties).with_group_key_bits(key.bits().to_vec()))
        .await
        .unwrap();
    let e = agent(&net, &eve, &parties).await;
    assert_eq!(a.group_key_bits(), Some(*key.bits()));
    assert_eq!(e.group_key_bits(), None);

    let (on_bob, mut rx_bob) = listener();
    let (on_eve, mut rx_eve) = listener();
    b.register(Channel::Update, "doc", on_bob).unwrap();
    e.register(Channel::Update, "doc", on_eve).unwrap();
    for agent in [&a, &b, &e] {
        agent.set_ready(true).unwrap();
    }

    a.publish_update("doc", &b"for members only"[..]).await.unwrap();
    let (content, _) = next(&mut rx_bob).await;
    assert_eq!(content.as_ref(), b"for members only");

    let eve_caught_up = wait_until(Duration::from_secs(5), || {
        let e = Arc::clone(&e);
        let id = alice.node_id.clone();
        async move { e.update_sync_state().await.get(&id) == 1 }
    })
    .await;
    assert!(eve_caught_up);
    assert!(rx_eve.try_recv().is_err());

    for agent in [a, b, e] {
        agent.destroy().await;
    }
}

#[tokio::test]
async fn test_status_converges_to_newest() {
    init_tracing();
    let net = TestNetwork::new();
    let carol = TestFixture::new("/app/carol");
    let bob = TestFixture::new("/app/bob");
    let parties = [&carol, &bob];

    let c = agent(&net, &carol, &parties).await;
    let b = agent(&net, &bob, &parties).await;
    let (on_status, mut rx) = listener();
    b.register(Channel::Status, "presence", on_status).unwrap();
    c.set_ready(true).unwrap();

    c.publish_status("presence", &b"online"[..]).await.unwrap();
    let away = c.publish_status("presence", &b"away"[..]).await.unwrap();
    b.set_ready(true).unwrap();

    loop {
        let (content, name) = next(&mut rx).await;
        if content.as_ref() == b"away" {
            assert_eq!(name, away);
            break;
        }
        assert_eq!(content.as_ref(), b"online");
    }

    // Only the exact newest name is answered.
    assert!(c.serve(&away).await.is_some());
    let stale = away.drop_last(1).append(namesync::core::Component::sequence(1));
    assert!(c.serve(&stale).await.is_none());

    c.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_pushed_blob_is_fetchable() {
    init_tracing();
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let parties = [&alice, &bob];

    let a = agent(&net, &alice, &parties).await;
    let verifier = VerifierChain::new()
        .reject_unsigned()
        .under(n("/app"), trusting_verifier(&parties));
    let b = SyncAgent::create(AgentParams::new(
        bob.node_id.clone(),
        bob.storage.clone(),
        net.transport(),
        bob.signer(),
        Arc::new(verifier),
    ))
    .await
    .unwrap();
    let (on_blob, mut rx) = listener();
    b.register(Channel::Blob, "files", on_blob).unwrap();
    b.register(Channel::Update, "doc", listener().0).unwrap();
    a.set_ready(true).unwrap();
    b.set_ready(true).unwrap();

    let photo: Bytes = vec![7u8; 30_000].into();
    let name = a.publish_blob("files", photo.clone(), None, true).await.unwrap();
    assert!(n("/app/blob").is_prefix_of(&name));
    assert!(alice.storage.has(&name.to_string()).await.unwrap());
    let last = name.append(namesync::core::Component::segment(3));
    assert!(alice.storage.has(&last.to_string()).await.unwrap());
    let beyond = name.append(namesync::core::Component::segment(4));
    assert!(!alice.storage.has(&beyond.to_string()).await.unwrap());

    let (announced, _) = next(&mut rx).await;
    assert_eq!(Name::decode(&announced).unwrap(), name);
    assert_eq!(b.get_blob(&name).await.unwrap(), Some(photo));

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_named_blob_without_push() {
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let a = agent(&net, &alice, &[&alice]).await;

    let name = n("/app/alice/avatar");
    let stored = a
        .publish_blob("files", &b"tiny"[..], Some(name.clone()), false)
        .await
        .unwrap();
    assert_eq!(stored, name);
    assert_eq!(a.get_blob(&name).await.unwrap().as_deref(), Some(&b"tiny"[..]));

    // Nothing was announced.
    assert_eq!(a.update_sync_state().await, StateVector::new());
    a.destroy().await;
}

#[tokio::test]
async fn test_oversized_segment_size_is_capped() {
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let config = AgentConfig {
        segment_size: 20_000,
        ..AgentConfig::default()
    };
    let a = SyncAgent::create(params(&net, &alice, &[&alice]).with_config(config))
        .await
        .unwrap();

    let name = n("/app/alice/archive");
    let content: Bytes = vec![1u8; 20_000].into();
    a.publish_blob("files", content.clone(), Some(name.clone()), false)
        .await
        .unwrap();

    for index in 0..3u64 {
        let segment = alice
            .storage
            .get_item(&name.append(namesync::core::Component::segment(index)))
            .await
            .unwrap()
            .unwrap();
        assert!(segment.content.len() <= MAX_SEGMENT_SIZE);
        assert_eq!(segment.final_block, Some(2));
    }
    assert_eq!(a.get_blob(&name).await.unwrap(), Some(content));
    a.destroy().await;
}

#[tokio::test]
async fn test_missing_blob_is_none() {
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let config = AgentConfig {
        blob_fetch: FetchPolicy {
            retx_limit: 1,
            lifetime_after_rto: Duration::from_millis(50),
            ..FetchPolicy::blob()
        },
        ..AgentConfig::default()
    };
    let a = agent(&net, &alice, &[&alice, &bob]).await;
    let b = SyncAgent::create(params(&net, &bob, &[&alice, &bob]).with_config(config))
        .await
        .unwrap();

    let missing = n("/app/blob/00ff");
    assert_eq!(b.get_blob(&missing).await.unwrap(), None);

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_readiness_rules() {
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let a = agent(&net, &alice, &[&alice]).await;

    assert!(!a.is_ready());
    assert!(a.set_ready(false).is_ok());
    assert!(matches!(
        a.publish_update("doc", &b"early"[..]).await,
        Err(AgentError::Sync(_))
    ));

    a.register(Channel::Update, "doc", listener().0).unwrap();
    a.set_ready(true).unwrap();
    a.set_ready(true).unwrap();
    assert!(a.is_ready());

    assert!(matches!(a.set_ready(false), Err(AgentError::Misuse(_))));
    assert!(matches!(
        a.register(Channel::Update, "notes", listener().0),
        Err(AgentError::Misuse(_))
    ));
    a.register(Channel::Status, "presence", listener().0).unwrap();
    assert!(a.unregister(Channel::Status, "presence"));
    assert!(!a.unregister(Channel::Status, "presence"));

    a.destroy().await;
}

#[tokio::test]
async fn test_serve_ignores_short_and_sync_names() {
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let a = agent(&net, &alice, &[&alice]).await;
    a.register(Channel::Update, "doc", listener().0).unwrap();
    a.set_ready(true).unwrap();

    let name = a.publish_update("doc", &b"x"[..]).await.unwrap();
    let item = a.serve(&name).await.unwrap();
    assert_eq!(item.name, name);

    assert!(a.serve(&n("/app")).await.is_none());
    assert!(a.serve(&n("/app/alice")).await.is_none());
    assert!(a.serve(&n("/app/32=sync/32=alo/state")).await.is_none());
    assert!(a.serve(&n("/app/alice/unknown")).await.is_none());

    a.destroy().await;
}

#[tokio::test]
async fn test_replay_updates() {
    init_tracing();
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let parties = [&alice, &bob];

    let a = agent(&net, &alice, &parties).await;
    let b = agent(&net, &bob, &parties).await;
    let (on_update, mut rx) = listener();
    b.register(Channel::Update, "doc", on_update).unwrap();
    let (on_notes, mut rx_notes) = listener();
    b.register(Channel::Update, "notes", on_notes).unwrap();
    a.set_ready(true).unwrap();
    b.set_ready(true).unwrap();

    a.publish_update("doc", &b"one"[..]).await.unwrap();
    a.publish_update("notes", &b"aside"[..]).await.unwrap();
    a.publish_update("doc", &b"two"[..]).await.unwrap();

    let caught_up = wait_until(Duration::from_secs(10), || {
        let b = Arc::clone(&b);
        let id = alice.node_id.clone();
        async move { b.update_sync_state().await.get(&id) == 3 }
    })
    .await;
    assert!(caught_up);
    let mut live = Vec::new();
    while let Ok((content, _)) = rx.try_recv() {
        live.push(content);
    }
    live.sort();
    live.dedup();
    assert_eq!(live, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    assert_eq!(next(&mut rx_notes).await.0.as_ref(), b"aside");

    b.replay_updates("doc", None).await.unwrap();
    let mut replayed = vec![next(&mut rx).await.0, next(&mut rx).await.0];
    replayed.sort();
    assert_eq!(replayed, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    assert!(rx_notes.try_recv().is_err());

    // Nothing after the checkpoint.
    let checkpoint = b.update_sync_state().await;
    b.replay_updates("doc", Some(&checkpoint)).await.unwrap();
    assert!(rx.try_recv().is_err());

    assert!(matches!(
        b.replay_updates("unknown", None).await,
        Err(AgentError::Misuse(_))
    ));

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_bundled_updates_publish_merged() {
    init_tracing();
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let bob = TestFixture::new("/app/bob");
    let parties = [&alice, &bob];

    let a = agent(&net, &alice, &parties).await;
    let b = agent(&net, &bob, &parties).await;
    let (on_update, mut rx) = listener();
    b.register(Channel::Update, "doc", on_update).unwrap();
    a.set_ready(true).unwrap();
    b.set_ready(true).unwrap();

    let merge: Merge = Arc::new(|chunks: Vec<Bytes>| Bytes::from(chunks.concat()));
    let bundler = a.bundled_updates("doc", merge, BundlerConfig::default());
    bundler.produce(Bytes::from_static(b"Hello ")).await;
    bundler.produce(Bytes::from_static(b"World.")).await;
    bundler.issue().await;

    assert_eq!(next(&mut rx).await.0.as_ref(), b"Hello World.");
    assert_eq!(a.update_sync_state().await.get(&alice.node_id), 1);

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_sequence_survives_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let net = TestNetwork::new();
    let alice = TestFixture::new("/app/alice");
    let verifier = trusting_verifier(&[&alice]);

    let open = || {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&path).unwrap());
        AgentParams::new(
            alice.node_id.clone(),
            storage,
            net.transport(),
            alice.signer(),
            verifier.clone(),
        )
    };

    let first = SyncAgent::create(open()).await.unwrap();
    first.register(Channel::Update, "doc", listener().0).unwrap();
    first.set_ready(true).unwrap();
    let one = first.publish_update("doc", &b"one"[..]).await.unwrap();
    assert_eq!(one.sequence(), Some(1));
    first.destroy().await;
    drop(first);

    let second = SyncAgent::create(open()).await.unwrap();
    second.register(Channel::Update, "doc", listener().0).unwrap();
    second.set_ready(true).unwrap();
    let two = second.publish_update("doc", &b"two"[..]).await.unwrap();
    assert_eq!(two.sequence(), Some(2));
    assert!(second.serve(&one).await.is_some());
    second.destroy().await;
}
