//! Sessions over in-process transports: reconnect catch-up, relays across
//! several sessions, forced resync, peer expiry, verification failures and
//! timeouts.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tandem_core::config::AttachmentConfig;
use tandem_core::{ActorId, ChangeId, EntityId, TandemError, TandemResult};
use tandem_storage::AttachmentStore;
use tandem_sync::session::SessionOutcome;
use tandem_sync::{
    run_session, FrameCodec, Message, Mutation, Replica, ReplicaIdentity, ReplicaOptions,
    SelectiveSync, SessionConfig, SessionState, SyncCounters, VectorClock, PROTOCOL_VERSION,
};

async fn node(actor: &str) -> (Replica, SelectiveSync) {
    node_with(actor, ReplicaOptions::default()).await
}

async fn node_with(actor: &str, options: ReplicaOptions) -> (Replica, SelectiveSync) {
    let replica = Replica::in_memory(ReplicaIdentity::with_actor(actor), options).unwrap();
    let attachments = SelectiveSync::open(AttachmentStore::in_memory().unwrap(), &AttachmentConfig::default())
        .await
        .unwrap();
    (replica, attachments)
}

struct Pair {
    cancel: CancellationToken,
    counters: Arc<SyncCounters>,
    left: JoinHandle<TandemResult<SessionOutcome>>,
    right: JoinHandle<TandemResult<SessionOutcome>>,
}

fn connect(a: &(Replica, SelectiveSync), b: &(Replica, SelectiveSync)) -> Pair {
    let (l, r) = tokio::io::duplex(256 * 1024);
    let cancel = CancellationToken::new();
    let counters = Arc::new(SyncCounters::default());
    let left = tokio::spawn(run_session(
        a.0.clone(),
        a.1.clone(),
        l,
        SessionConfig::default(),
        counters.clone(),
        cancel.clone(),
    ));
    let right = tokio::spawn(run_session(
        b.0.clone(),
        b.1.clone(),
        r,
        SessionConfig::default(),
        counters.clone(),
        cancel.clone(),
    ));
    Pair {
        cancel,
        counters,
        left,
        right,
    }
}

impl Pair {
    async fn close(self) -> (SessionOutcome, SessionOutcome) {
        self.cancel.cancel();
        (
            self.left.await.unwrap().unwrap(),
            self.right.await.unwrap().unwrap(),
        )
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{what} never happened");
}

/// Run `replica`'s side of a session against a hand-driven peer that has
/// already read our `Hello`.
async fn raw_peer(
    node: &(Replica, SelectiveSync),
    counters: Arc<SyncCounters>,
    cancel: CancellationToken,
) -> (
    Framed<tokio::io::DuplexStream, FrameCodec>,
    JoinHandle<TandemResult<SessionOutcome>>,
) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let task = tokio::spawn(run_session(
        node.0.clone(),
        node.1.clone(),
        local,
        SessionConfig::default(),
        counters,
        cancel,
    ));
    let mut peer = Framed::new(remote, FrameCodec::default());
    let hello = peer.next().await.unwrap().unwrap();
    assert_eq!(hello.kind(), "hello");
    (peer, task)
}

fn change(r: &Replica, id: ChangeId) -> tandem_sync::Change {
    r.changes_for(&BTreeSet::from([id])).pop().unwrap()
}

async fn until_streaming(r: &Replica, peer: &str) {
    let peer = ActorId::new(peer);
    for _ in 0..500 {
        if r.get_sync_status(&peer)
            .is_ok_and(|s| s.state == SessionState::Update)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session with {peer} never reached update");
}

#[tokio::test]
async fn reconnect_transfers_exactly_the_new_change() {
    let a = node("actor-a").await;
    let b = node("actor-b").await;
    let session = EntityId::new("session-s");
    for i in 0..10 {
        a.0.emit_local_change(&session, Mutation::insert("messages", i, format!("m{i}")))
            .unwrap();
    }

    let first = connect(&a, &b);
    until_streaming(&a.0, "actor-b").await;
    until_streaming(&b.0, "actor-a").await;
    assert_eq!(a.0.combined_root(), b.0.combined_root());
    let (_, b_first) = first.close().await;
    assert_eq!(b_first.changes_received, 10);

    a.0.emit_local_change(&session, Mutation::set("title", "Trip Planning"))
        .unwrap();
    assert_ne!(a.0.combined_root(), b.0.combined_root());

    let second = connect(&a, &b);
    until_streaming(&a.0, "actor-b").await;
    until_streaming(&b.0, "actor-a").await;
    assert_eq!(a.0.combined_root(), b.0.combined_root());
    assert_eq!(b.0.document(&session), a.0.document(&session));

    let (a_second, b_second) = second.close().await;
    assert_eq!(b_second.changes_received, 1);
    assert_eq!(a_second.changes_sent, 1);
    assert_eq!(a_second.changes_received, 0);

    let status = a.0.get_sync_status(&ActorId::new("actor-b")).unwrap();
    assert_eq!(status.pending_change_count, 0);
    assert_eq!(status.state, SessionState::Closed);
    assert!(status.last_synced_at.is_some());
}

#[tokio::test]
async fn live_edits_stream_both_ways() {
    let a = node("actor-a").await;
    let b = node("actor-b").await;
    let c = node("actor-c").await;
    let session = EntityId::new("session-s");

    let ab = connect(&a, &b);
    let bc = connect(&b, &c);
    until_streaming(&a.0, "actor-b").await;
    until_streaming(&c.0, "actor-b").await;

    a.0.emit_local_change(&session, Mutation::add("tags", "from-a")).unwrap();
    c.0.emit_local_change(&session, Mutation::add("tags", "from-c")).unwrap();

    for _ in 0..500 {
        if a.0.combined_root() == c.0.combined_root() && b.0.combined_root() == a.0.combined_root() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let tags = a.0.document(&session).unwrap()["tags"].clone();
    assert_eq!(tags, serde_json::json!(["from-a", "from-c"]));
    assert_eq!(c.0.document(&session), a.0.document(&session));

    ab.close().await;
    bc.close().await;
}

#[tokio::test]
async fn forced_resync_returns_to_update() {
    let a = node("actor-a").await;
    let b = node("actor-b").await;
    b.0.emit_local_change(&EntityId::new("doc"), Mutation::set("k", 1))
        .unwrap();

    let pair = connect(&a, &b);
    until_streaming(&a.0, "actor-b").await;

    a.0.force_resync(&ActorId::new("actor-b")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    until_streaming(&a.0, "actor-b").await;
    until_streaming(&b.0, "actor-a").await;
    assert!(pair.counters.resyncs.load(Ordering::Relaxed) >= 1);
    assert_eq!(a.0.combined_root(), b.0.combined_root());
    pair.close().await;
}

/// Answers every round with a `Verify` that cannot match.
async fn lying_peer(stream: tokio::io::DuplexStream, depth: u8) {
    let mut peer = Framed::new(stream, FrameCodec::default());
    while let Some(Ok(message)) = peer.next().await {
        let reply = match message {
            Message::Hello { .. } => Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                actor_id: ActorId::new("mallory"),
                root_hashes: BTreeMap::new(),
                clock: VectorClock::new(),
                index_depth: depth,
            },
            Message::Verify { .. } => Message::Verify {
                root_hash: "ff".repeat(32),
            },
            _ => continue,
        };
        if peer.send(reply).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn repeated_root_mismatch_fails_the_session() {
    let (replica, attachments) = node("actor-a").await;
    let (local, remote) = tokio::io::duplex(64 * 1024);
    tokio::spawn(lying_peer(remote, replica.index_depth()));

    let counters = Arc::new(SyncCounters::default());
    let config = SessionConfig {
        max_checksum_failures: 3,
        ..SessionConfig::default()
    };
    let err = run_session(
        replica.clone(),
        attachments,
        local,
        config,
        counters.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TandemError::ChecksumMismatch { .. }));
    assert_eq!(counters.checksum_failures.load(Ordering::Relaxed), 3);
    let status = replica.get_sync_status(&ActorId::new("mallory")).unwrap();
    assert_eq!(status.state, SessionState::Failed);
    assert!(status.last_synced_at.is_none());
}

#[tokio::test]
async fn silent_peer_times_out() {
    let (replica, attachments) = node("actor-a").await;
    let (local, _remote) = tokio::io::duplex(4096);
    let config = SessionConfig {
        hello_timeout: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    let err = run_session(
        replica,
        attachments,
        local,
        config,
        Arc::new(SyncCounters::default()),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TandemError::Timeout("capability_exchange")));
}

#[tokio::test]
async fn messages_before_hello_are_refused() {
    let (replica, attachments) = node("actor-a").await;
    let (local, remote) = tokio::io::duplex(4096);
    let mut peer = Framed::new(remote, FrameCodec::default());
    let task = tokio::spawn(run_session(
        replica,
        attachments,
        local,
        SessionConfig::default(),
        Arc::new(SyncCounters::default()),
        CancellationToken::new(),
    ));
    let _hello = peer.next().await.unwrap().unwrap();
    peer.send(Message::DeltaRequest {
        missing_change_ids: Vec::new(),
    })
    .await
    .unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, TandemError::Codec(_)));
}

#[tokio::test]
async fn relayed_change_waits_for_its_dependency_from_another_session() {
    let a = node("actor-a").await;
    let b = node("actor-b").await;
    let c = node("actor-c").await;
    let session = EntityId::new("session-s");

    // B answers A's message before C has heard of it.
    let first = a.0.emit_local_change(&session, Mutation::insert("messages", 0, "from a"))
        .unwrap();
    b.0.apply_remote(change(&a.0, first), None).unwrap();
    let reply = b.0.emit_local_change(&session, Mutation::insert("messages", 1, "from b"))
        .unwrap();

    // B reaches C first and pushes only its reply.
    let cancel = CancellationToken::new();
    let (mut from_b, bc) = raw_peer(&c, Arc::new(SyncCounters::default()), cancel.clone()).await;
    from_b.send(b.0.hello()).await.unwrap();
    from_b
        .send(Message::UpdateChange {
            change: change(&b.0, reply),
        })
        .await
        .unwrap();
    eventually("reply buffered on C", || c.0.stats().pending == 1).await;
    assert!(c.0.document(&session).is_none());

    // The dependency arrives over C's session with A, and the reply is
    // relayed on to A.
    let ca = connect(&c, &a);
    eventually("C and A converged", || {
        c.0.stats().pending == 0 && a.0.combined_root() == c.0.combined_root()
    })
    .await;
    assert_eq!(
        c.0.document(&session).unwrap()["messages"],
        json!(["from a", "from b"])
    );
    assert_eq!(a.0.document(&session), c.0.document(&session));

    ca.close().await;
    cancel.cancel();
    let _ = bc.await;
}

#[tokio::test]
async fn triangle_of_sessions_converges_on_concurrent_edits() {
    let a = node("actor-a").await;
    let b = node("actor-b").await;
    let c = node("actor-c").await;
    let session = EntityId::new("session-s");

    let ab = connect(&a, &b);
    let bc = connect(&b, &c);
    let ca = connect(&c, &a);
    for (r, peer) in [
        (&a.0, "actor-b"),
        (&a.0, "actor-c"),
        (&b.0, "actor-a"),
        (&b.0, "actor-c"),
        (&c.0, "actor-a"),
        (&c.0, "actor-b"),
    ] {
        until_streaming(r, peer).await;
    }

    for i in 0..5 {
        a.0.emit_local_change(&session, Mutation::add("tags", format!("a{i}")))
            .unwrap();
        b.0.emit_local_change(&session, Mutation::insert("messages", i, format!("b{i}")))
            .unwrap();
        c.0.emit_local_change(&session, Mutation::set("title", format!("c{i}")))
            .unwrap();
    }

    eventually("all three converged", || {
        let root = a.0.combined_root();
        b.0.combined_root() == root
            && c.0.combined_root() == root
            && [&a.0, &b.0, &c.0].iter().all(|r| r.stats().pending == 0)
    })
    .await;
    let doc = a.0.document(&session).unwrap();
    assert_eq!(doc["tags"].as_array().unwrap().len(), 5);
    assert_eq!(doc["messages"], json!(["b0", "b1", "b2", "b3", "b4"]));
    assert_eq!(doc["title"], "c4");
    assert_eq!(b.0.document(&session).as_ref(), Some(&doc));
    assert_eq!(c.0.document(&session).as_ref(), Some(&doc));
    assert_eq!(a.0.change_count(), 15);

    ab.close().await;
    bc.close().await;
    ca.close().await;
}

#[tokio::test]
async fn pending_overflow_restarts_from_hello() {
    let options = ReplicaOptions {
        max_pending_changes: 1,
        ..ReplicaOptions::default()
    };
    let a = node_with("actor-a", options).await;
    let b = node("actor-b").await;
    let doc = EntityId::new("doc");
    let ids: BTreeSet<ChangeId> = (0..3)
        .map(|i| b.0.emit_local_change(&doc, Mutation::set("k", i)).unwrap())
        .collect();
    let mut changes = b.0.changes_for(&ids);
    let third = changes.pop().unwrap();
    let second = changes.pop().unwrap();

    let counters = Arc::new(SyncCounters::default());
    let cancel = CancellationToken::new();
    let (mut peer, task) = raw_peer(&a, counters.clone(), cancel.clone()).await;
    peer.send(b.0.hello()).await.unwrap();
    peer.send(Message::UpdateChange { change: second }).await.unwrap();
    peer.send(Message::UpdateChange { change: third }).await.unwrap();

    // The dropped change sends the session back to capability exchange.
    loop {
        if let Message::Hello { .. } = peer.next().await.unwrap().unwrap() {
            break;
        }
    }
    assert!(counters.resyncs.load(Ordering::Relaxed) >= 1);
    assert_eq!(a.0.stats().pending, 1);
    assert!(
        a.0.get_sync_status(&ActorId::new("actor-b"))
            .unwrap()
            .needs_full_resync
    );

    cancel.cancel();
    let _ = task.await;
}

/// Sync A and C once, then let A collect tombstones long after C went
/// quiet.
async fn expire_peer_after_collection(
    a: &(Replica, SelectiveSync),
    c: &(Replica, SelectiveSync),
    session: &EntityId,
) {
    a.0.emit_local_change(session, Mutation::set("title", "start")).unwrap();
    let first = connect(a, c);
    until_streaming(&a.0, "actor-c").await;
    until_streaming(&c.0, "actor-a").await;
    first.close().await;

    a.0.emit_local_change(session, Mutation::add("tags", "x")).unwrap();
    a.0.emit_local_change(session, Mutation::remove("tags", "x")).unwrap();
    let later = a.0.now_ms() + ReplicaOptions::default().peer_expiry_ms + 1;
    let report = a.0.collect_garbage(later).unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(report.bootstrap_required, vec![ActorId::new("actor-c")]);
}

#[tokio::test]
async fn expired_peer_with_unseen_changes_must_bootstrap() {
    let a = node("actor-a").await;
    let c = node("actor-c").await;
    let session = EntityId::new("session-s");
    expire_peer_after_collection(&a, &c, &session).await;
    let offline = c.0.emit_local_change(&session, Mutation::add("tags", "x")).unwrap();

    let pair = connect(&a, &c);
    let err = pair.left.await.unwrap().unwrap_err();
    assert!(matches!(err, TandemError::BootstrapRequired(_)));
    let _ = pair.right.await;

    let status = a.0.get_sync_status(&ActorId::new("actor-c")).unwrap();
    assert!(status.bootstrap_required);
    assert_eq!(status.state, SessionState::Failed);
    assert!(!a.0.knows(&offline));
    assert!(a.0.document(&session).unwrap()["tags"]
        .as_array()
        .map_or(true, |t| t.is_empty()));
}

#[tokio::test]
async fn expired_peer_without_new_changes_catches_up() {
    let a = node("actor-a").await;
    let c = node("actor-c").await;
    let session = EntityId::new("session-s");
    expire_peer_after_collection(&a, &c, &session).await;

    let pair = connect(&a, &c);
    until_streaming(&a.0, "actor-c").await;
    until_streaming(&c.0, "actor-a").await;
    assert_eq!(a.0.combined_root(), c.0.combined_root());
    assert_eq!(a.0.document(&session), c.0.document(&session));

    let status = a.0.get_sync_status(&ActorId::new("actor-c")).unwrap();
    assert!(!status.bootstrap_required);
    assert!(!status.needs_full_resync);
    pair.close().await;
}
