//! Attachment transfer: chunk verification, targeted re-requests, resumed
//! transfers, and automatic fetching over a live session.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tandem_chunks::{hash_bytes, hash_to_hex};
use tandem_core::config::AttachmentConfig;
use tandem_core::{EntityId, SyncTier, TandemError, TandemResult};
use tandem_storage::{AttachmentManifest, AttachmentStore};
use tandem_sync::attachments::ChunkReply;
use tandem_sync::{
    run_session, ChunkSource, Mutation, Replica, ReplicaIdentity, ReplicaOptions, SelectiveSync,
    SessionConfig, SyncCounters,
};

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

async fn selective(default_tier: SyncTier) -> SelectiveSync {
    let cfg = AttachmentConfig {
        root: None,
        default_tier,
        max_chunk_retries: 2,
    };
    SelectiveSync::open(AttachmentStore::in_memory().unwrap(), &cfg)
        .await
        .unwrap()
}

/// Serves from another replica's store, counting requests per chunk and
/// optionally damaging or refusing chosen chunks.
struct Recorder {
    origin: SelectiveSync,
    requests: Mutex<BTreeMap<u32, usize>>,
    corrupt_once: Option<u32>,
    corrupted: AtomicBool,
    fail_from: Option<u32>,
}

impl Recorder {
    fn new(origin: SelectiveSync) -> Self {
        Recorder {
            origin,
            requests: Mutex::new(BTreeMap::new()),
            corrupt_once: None,
            corrupted: AtomicBool::new(false),
            fail_from: None,
        }
    }

    fn requests(&self) -> BTreeMap<u32, usize> {
        self.requests.lock().clone()
    }
}

impl ChunkSource for Recorder {
    async fn manifest(&self, content_hash: &str) -> TandemResult<AttachmentManifest> {
        self.origin.manifest(content_hash).await
    }

    async fn chunk(&self, content_hash: &str, chunk_index: u32) -> TandemResult<ChunkReply> {
        *self.requests.lock().entry(chunk_index).or_default() += 1;
        if self.fail_from.is_some_and(|from| chunk_index >= from) {
            return Err(TandemError::Transport("connection dropped".into()));
        }
        let mut reply = self.origin.chunk(content_hash, chunk_index).await?;
        if self.corrupt_once == Some(chunk_index) && !self.corrupted.swap(true, Ordering::SeqCst) {
            reply.bytes[0] ^= 0xFF;
        }
        Ok(reply)
    }
}

#[tokio::test]
async fn only_the_damaged_chunk_is_requested_again() {
    let origin = selective(SyncTier::OnDemand).await;
    let data = noise(220 * 1024, 23);
    let attachment = origin.add(&data, Some("application/pdf".into())).await.unwrap();
    let manifest = origin.store().manifest(&attachment.content_hash).await.unwrap().unwrap();
    assert!(
        manifest.chunks.len() > 30,
        "expected a many-chunk attachment, got {}",
        manifest.chunks.len()
    );

    let replica = selective(SyncTier::OnDemand).await;
    let source = Recorder {
        corrupt_once: Some(23),
        ..Recorder::new(origin.clone())
    };
    let fetched = replica.fetch(&attachment.content_hash, &source).await.unwrap();

    assert_eq!(fetched, data);
    assert_eq!(hash_to_hex(&hash_bytes(&fetched)), attachment.content_hash);
    let requests = source.requests();
    assert_eq!(requests.len(), manifest.chunks.len());
    for (index, count) in requests {
        let expected = if index == 23 { 2 } else { 1 };
        assert_eq!(count, expected, "chunk {index} requested {count} times");
    }
}

#[tokio::test]
async fn interrupted_transfer_resumes_where_it_stopped() {
    let origin = selective(SyncTier::OnDemand).await;
    let data = noise(120 * 1024, 7);
    let attachment = origin.add(&data, None).await.unwrap();
    let chunk_count = origin
        .store()
        .manifest(&attachment.content_hash)
        .await
        .unwrap()
        .unwrap()
        .chunks
        .len() as u32;
    assert!(chunk_count > 10);

    let replica = selective(SyncTier::OnDemand).await;
    let broken = Recorder {
        fail_from: Some(10),
        ..Recorder::new(origin.clone())
    };
    let err = replica
        .fetch(&attachment.content_hash, &broken)
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::Transport(_)));
    assert!(!replica.is_local(&attachment.content_hash).await.unwrap());

    let healthy = Recorder::new(origin);
    let fetched = replica.fetch(&attachment.content_hash, &healthy).await.unwrap();
    assert_eq!(fetched, data);
    let requested: Vec<u32> = healthy.requests().into_keys().collect();
    assert_eq!(requested, (10..chunk_count).collect::<Vec<_>>());
}

#[tokio::test]
async fn metadata_only_attachments_stay_remote() {
    let origin = selective(SyncTier::OnDemand).await;
    let attachment = origin.add(&noise(10 * 1024, 1), None).await.unwrap();

    let replica = selective(SyncTier::MetadataOnly).await;
    assert_eq!(replica.register(&attachment).await.unwrap(), SyncTier::MetadataOnly);
    let source = Recorder::new(origin);
    let err = replica.fetch(&attachment.content_hash, &source).await.unwrap_err();
    assert!(matches!(err, TandemError::TierForbidsTransfer(_)));
    assert!(source.requests().is_empty());
}

#[tokio::test]
async fn always_tier_is_pulled_over_the_session() {
    let a_replica =
        Replica::in_memory(ReplicaIdentity::with_actor("actor-a"), ReplicaOptions::default()).unwrap();
    let b_replica =
        Replica::in_memory(ReplicaIdentity::with_actor("actor-b"), ReplicaOptions::default()).unwrap();
    let a_files = selective(SyncTier::OnDemand).await;
    let b_files = selective(SyncTier::Always).await;

    let data = noise(64 * 1024, 99);
    let attachment = a_files.add(&data, Some("image/png".into())).await.unwrap();
    let session = EntityId::new("session-s");
    a_replica
        .emit_local_change(
            &session,
            Mutation::Attach {
                field: "cover".into(),
                attachment: attachment.clone(),
            },
        )
        .unwrap();

    let (l, r) = tokio::io::duplex(256 * 1024);
    let cancel = CancellationToken::new();
    let counters = Arc::new(SyncCounters::default());
    let left = tokio::spawn(run_session(
        a_replica.clone(),
        a_files,
        l,
        SessionConfig::default(),
        counters.clone(),
        cancel.clone(),
    ));
    let right = tokio::spawn(run_session(
        b_replica.clone(),
        b_files.clone(),
        r,
        SessionConfig::default(),
        counters,
        cancel.clone(),
    ));

    let mut local = false;
    for _ in 0..500 {
        local = b_files.is_local(&attachment.content_hash).await.unwrap();
        if local {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(local, "attachment never arrived");
    assert_eq!(b_files.store().read(&attachment.content_hash).await.unwrap(), data);
    assert_eq!(
        b_replica.document(&session).unwrap()["cover"]["content_hash"],
        attachment.content_hash.as_str()
    );

    cancel.cancel();
    left.await.unwrap().unwrap();
    right.await.unwrap().unwrap();
}
