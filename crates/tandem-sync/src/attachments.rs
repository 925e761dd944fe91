//! Selective sync of attachment payloads.
//!
//! Attachment metadata (hash, size, media type) rides along with document
//! changes and always replicates. The payload moves separately, chunk by
//! chunk, according to its tier:
//!   metadata_only  never transferred
//!   on_demand      transferred when `request`/`fetch` is called
//!   always         transferred as soon as the metadata arrives
//!
//! Every received chunk is checked against the manifest's chunk hash before
//! it is stored. A bad chunk is re-requested on its own; chunks already
//! stored are skipped, so an interrupted transfer resumes where it stopped.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use tandem_core::config::AttachmentConfig;
use tandem_core::{SyncTier, TandemError, TandemResult};
use tandem_storage::{AttachmentManifest, AttachmentStore};

use crate::change::AttachmentRef;
use crate::protocol::Message;

/// One chunk as delivered by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReply {
    pub bytes: Vec<u8>,
    /// Hash the sender claims for `bytes`
    pub chunk_hash: String,
}

/// Somewhere attachment chunks can be fetched from, usually a live session
/// with a peer.
pub trait ChunkSource: Send + Sync {
    fn manifest(
        &self,
        content_hash: &str,
    ) -> impl Future<Output = TandemResult<AttachmentManifest>> + Send;

    fn chunk(
        &self,
        content_hash: &str,
        chunk_index: u32,
    ) -> impl Future<Output = TandemResult<ChunkReply>> + Send;
}

fn storage(e: anyhow::Error) -> TandemError {
    TandemError::Storage(format!("{e:#}"))
}

struct Inner {
    store: AttachmentStore,
    tiers: Mutex<BTreeMap<String, SyncTier>>,
    default_tier: SyncTier,
    max_chunk_retries: u32,
}

#[derive(Clone)]
pub struct SelectiveSync {
    inner: Arc<Inner>,
}

impl SelectiveSync {
    pub async fn open(store: AttachmentStore, cfg: &AttachmentConfig) -> TandemResult<Self> {
        let tiers = store.load_tiers().await.map_err(storage)?;
        Ok(SelectiveSync {
            inner: Arc::new(Inner {
                store,
                tiers: Mutex::new(tiers),
                default_tier: cfg.default_tier,
                max_chunk_retries: cfg.max_chunk_retries,
            }),
        })
    }

    pub fn store(&self) -> &AttachmentStore {
        &self.inner.store
    }

    /// Store a locally created payload. The local copy is complete, so it is
    /// held at `always`.
    pub async fn add(&self, data: &[u8], media_type: Option<String>) -> TandemResult<AttachmentRef> {
        let manifest = self.inner.store.write(data).await.map_err(storage)?;
        self.set_tier(&manifest.content_hash, SyncTier::Always).await?;
        Ok(AttachmentRef {
            content_hash: manifest.content_hash,
            size: manifest.size,
            media_type,
        })
    }

    /// Record attachment metadata learned from a change. Unknown attachments
    /// get the configured default tier.
    pub async fn register(&self, attachment: &AttachmentRef) -> TandemResult<SyncTier> {
        let mut tiers = self.inner.tiers.lock().await;
        if let Some(tier) = tiers.get(&attachment.content_hash) {
            return Ok(*tier);
        }
        tiers.insert(attachment.content_hash.clone(), self.inner.default_tier);
        self.inner.store.save_tiers(&tiers).await.map_err(storage)?;
        debug!(hash = %attachment.content_hash, tier = ?self.inner.default_tier, "attachment registered");
        Ok(self.inner.default_tier)
    }

    pub async fn set_tier(&self, content_hash: &str, tier: SyncTier) -> TandemResult<()> {
        let mut tiers = self.inner.tiers.lock().await;
        if tiers.get(content_hash) == Some(&tier) {
            return Ok(());
        }
        tiers.insert(content_hash.to_string(), tier);
        self.inner.store.save_tiers(&tiers).await.map_err(storage)
    }

    pub async fn tier(&self, content_hash: &str) -> SyncTier {
        self.inner
            .tiers
            .lock()
            .await
            .get(content_hash)
            .copied()
            .unwrap_or(self.inner.default_tier)
    }

    /// Whether the complete payload is held locally.
    pub async fn is_local(&self, content_hash: &str) -> TandemResult<bool> {
        self.inner.store.contains(content_hash).await.map_err(storage)
    }

    /// Fetch (if needed) and return the complete payload.
    pub async fn fetch<S: ChunkSource>(&self, content_hash: &str, source: &S) -> TandemResult<Vec<u8>> {
        if !self.is_local(content_hash).await? {
            self.transfer(content_hash, source, None).await?;
        }
        self.inner.store.read(content_hash).await.map_err(storage)
    }

    /// Stream the payload chunk by chunk, in order, fetching from `source`
    /// whatever is not held locally.
    pub fn request<S>(&self, content_hash: &str, source: S) -> ReceiverStream<TandemResult<Vec<u8>>>
    where
        S: ChunkSource + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        let content_hash = content_hash.to_string();
        tokio::spawn(async move {
            let result = match this.is_local(&content_hash).await {
                Ok(true) => this.stream_local(&content_hash, &tx).await,
                Ok(false) => this
                    .transfer(&content_hash, &source, Some(&tx))
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    async fn stream_local(
        &self,
        content_hash: &str,
        tx: &mpsc::Sender<TandemResult<Vec<u8>>>,
    ) -> TandemResult<()> {
        let manifest = self
            .inner
            .store
            .manifest(content_hash)
            .await
            .map_err(storage)?
            .ok_or_else(|| TandemError::AttachmentNotFound(content_hash.to_string()))?;
        for chunk_hash in &manifest.chunks {
            let bytes = self.inner.store.read_chunk(chunk_hash).await.map_err(storage)?;
            if tx.send(Ok(bytes)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Pull every missing chunk from `source`, verify and store it, then
    /// publish the manifest.
    async fn transfer<S: ChunkSource>(
        &self,
        content_hash: &str,
        source: &S,
        sink: Option<&mpsc::Sender<TandemResult<Vec<u8>>>>,
    ) -> TandemResult<AttachmentManifest> {
        if self.tier(content_hash).await == SyncTier::MetadataOnly {
            return Err(TandemError::TierForbidsTransfer(content_hash.to_string()));
        }

        let manifest = source.manifest(content_hash).await?;
        if manifest.content_hash != content_hash {
            return Err(TandemError::Codec(format!(
                "asked for manifest {content_hash}, got {}",
                manifest.content_hash
            )));
        }

        let store = &self.inner.store;
        let mut fetched = 0usize;
        for (index, chunk_hash) in manifest.chunks.iter().enumerate() {
            let bytes = if store.has_chunk(chunk_hash).await.map_err(storage)? {
                store.read_chunk(chunk_hash).await.map_err(storage)?
            } else {
                fetched += 1;
                self.fetch_chunk(content_hash, index as u32, chunk_hash, source)
                    .await?
            };
            if let Some(tx) = sink {
                // A dropped receiver only stops the stream; the transfer
                // still completes.
                let _ = tx.send(Ok(bytes)).await;
            }
        }

        store.complete(&manifest).await.map_err(storage)?;
        info!(
            hash = %content_hash,
            chunks = manifest.chunk_count(),
            fetched,
            "attachment transfer complete"
        );
        Ok(manifest)
    }

    async fn fetch_chunk<S: ChunkSource>(
        &self,
        content_hash: &str,
        index: u32,
        expected: &str,
        source: &S,
    ) -> TandemResult<Vec<u8>> {
        let attempts = self.inner.max_chunk_retries + 1;
        for attempt in 1..=attempts {
            let reply = match source.chunk(content_hash, index).await {
                Ok(reply) => reply,
                Err(TandemError::Timeout(phase)) => {
                    warn!(hash = %content_hash, chunk = index, attempt, "chunk {phase} timed out");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self
                .inner
                .store
                .put_chunk(expected, &reply.bytes)
                .await
                .map_err(storage)?
            {
                return Ok(reply.bytes);
            }
            warn!(
                hash = %content_hash,
                chunk = index,
                attempt,
                claimed = %reply.chunk_hash,
                "chunk failed verification, re-requesting"
            );
        }
        Err(TandemError::Transport(format!(
            "chunk {index} of {content_hash} failed after {attempts} attempts"
        )))
    }

    /// Answer a peer's attachment request from the local store.
    pub async fn serve(&self, request: &Message) -> TandemResult<Option<Message>> {
        let reply = match request {
            Message::AttachmentManifestRequest { content_hash } => {
                match self.inner.store.manifest(content_hash).await.map_err(storage)? {
                    Some(m) => Message::AttachmentManifest {
                        content_hash: m.content_hash,
                        size: m.size,
                        chunks: m.chunks,
                    },
                    None => Message::AttachmentUnavailable {
                        content_hash: content_hash.clone(),
                    },
                }
            }
            Message::AttachmentChunkRequest {
                content_hash,
                chunk_index,
            } => {
                let manifest = self.inner.store.manifest(content_hash).await.map_err(storage)?;
                match manifest.and_then(|m| m.chunks.get(*chunk_index as usize).cloned()) {
                    Some(chunk_hash) => Message::AttachmentChunk {
                        content_hash: content_hash.clone(),
                        chunk_index: *chunk_index,
                        bytes: self
                            .inner
                            .store
                            .read_chunk(&chunk_hash)
                            .await
                            .map_err(storage)?,
                        chunk_hash,
                    },
                    None => Message::AttachmentUnavailable {
                        content_hash: content_hash.clone(),
                    },
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }
}

/// Serves chunks straight from another local store.
impl ChunkSource for SelectiveSync {
    async fn manifest(&self, content_hash: &str) -> TandemResult<AttachmentManifest> {
        self.inner
            .store
            .manifest(content_hash)
            .await
            .map_err(storage)?
            .ok_or_else(|| TandemError::AttachmentNotFound(content_hash.to_string()))
    }

    async fn chunk(&self, content_hash: &str, chunk_index: u32) -> TandemResult<ChunkReply> {
        match self
            .serve(&Message::AttachmentChunkRequest {
                content_hash: content_hash.to_string(),
                chunk_index,
            })
            .await?
        {
            Some(Message::AttachmentChunk {
                bytes, chunk_hash, ..
            }) => Ok(ChunkReply { bytes, chunk_hash }),
            _ => Err(TandemError::AttachmentNotFound(content_hash.to_string())),
        }
    }
}
