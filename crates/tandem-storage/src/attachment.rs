//! Content-addressed attachment store
//!
//! Layout inside the operator root:
//!   chunks/{chunk_hash}          one FastCDC chunk, stored once however many attachments share it
//!   manifests/{content_hash}     JSON `AttachmentManifest`, written only once every chunk is present
//!   tiers.json                   content hash -> sync tier
//!
//! A manifest's presence means the attachment is complete locally. Chunks that
//! arrive during a transfer are written as soon as their hash verifies, so an
//! interrupted transfer resumes by skipping chunks that already exist.

use anyhow::{Context, Result};
use opendal::Operator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use tandem_core::SyncTier;

const TIERS_KEY: &str = "tiers.json";

/// Ordered chunk list of one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentManifest {
    /// BLAKE3 of the complete payload (hex)
    pub content_hash: String,
    /// Payload size in bytes
    pub size: u64,
    /// Chunk BLAKE3 hashes (hex), in payload order
    pub chunks: Vec<String>,
}

impl AttachmentManifest {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Largest payload the chunk list can describe; no chunk travels in more
    /// than one frame.
    pub fn max_size(&self) -> u64 {
        (tandem_chunks::MAX_FRAME_BYTES as u64).saturating_mul(self.chunks.len() as u64)
    }

    /// Buffer capacity for reassembly, never trusting `size` past what the
    /// chunks could hold.
    fn reassembly_capacity(&self) -> usize {
        usize::try_from(self.size.min(self.max_size())).unwrap_or(0)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serializing attachment manifest")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("parsing attachment manifest")
    }
}

#[derive(Clone)]
pub struct AttachmentStore {
    op: Operator,
}

impl AttachmentStore {
    pub fn new(op: Operator) -> Self {
        AttachmentStore { op }
    }

    /// Store backed by an in-memory operator.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(crate::operator::memory_operator()?))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Chunk, store and register a payload. Chunks already present are skipped.
    pub async fn write(&self, data: &[u8]) -> Result<AttachmentManifest> {
        let content_hash = tandem_chunks::hash_to_hex(&tandem_chunks::hash_bytes(data));
        let chunks = tandem_chunks::chunk_data(data, tandem_chunks::ChunkSizes::for_len(data.len()));

        let mut chunk_hashes = Vec::with_capacity(chunks.len());
        let mut written = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            let chunk_hex = tandem_chunks::hash_to_hex(&chunk.hash);
            let key = chunk_key(&chunk_hex);
            let present = self
                .op
                .exists(&key)
                .await
                .with_context(|| format!("checking chunk {i}: {key}"))?;
            if !present {
                self.op
                    .write(&key, chunk.slice(data).to_vec())
                    .await
                    .with_context(|| format!("writing chunk {i}: {key}"))?;
                written += 1;
            }
            chunk_hashes.push(chunk_hex);
        }

        let manifest = AttachmentManifest {
            content_hash,
            size: data.len() as u64,
            chunks: chunk_hashes,
        };
        self.put_manifest(&manifest).await?;

        info!(
            hash = %manifest.content_hash,
            bytes = manifest.size,
            chunks = manifest.chunk_count(),
            new_chunks = written,
            "attachment stored"
        );
        Ok(manifest)
    }

    /// Reassemble a complete attachment, verifying the content hash.
    pub async fn read(&self, content_hash: &str) -> Result<Vec<u8>> {
        let manifest = self
            .manifest(content_hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("attachment not stored: {content_hash}"))?;

        let mut assembled = Vec::with_capacity(manifest.reassembly_capacity());
        for chunk_hex in &manifest.chunks {
            assembled.extend_from_slice(&self.read_chunk(chunk_hex).await?);
        }

        if !tandem_chunks::verify_hex(&assembled, content_hash) {
            anyhow::bail!("attachment {content_hash} failed verification after reassembly");
        }
        Ok(assembled)
    }

    /// Whether the full attachment is stored locally.
    pub async fn contains(&self, content_hash: &str) -> Result<bool> {
        self.op
            .exists(&manifest_key(content_hash))
            .await
            .with_context(|| format!("checking manifest {content_hash}"))
    }

    pub async fn manifest(&self, content_hash: &str) -> Result<Option<AttachmentManifest>> {
        if !self.contains(content_hash).await? {
            return Ok(None);
        }
        let key = manifest_key(content_hash);
        let bytes = self
            .op
            .read(&key)
            .await
            .with_context(|| format!("reading manifest: {key}"))?;
        AttachmentManifest::from_bytes(&bytes.to_vec()).map(Some)
    }

    pub async fn has_chunk(&self, chunk_hash: &str) -> Result<bool> {
        self.op
            .exists(&chunk_key(chunk_hash))
            .await
            .with_context(|| format!("checking chunk {chunk_hash}"))
    }

    pub async fn read_chunk(&self, chunk_hash: &str) -> Result<Vec<u8>> {
        let key = chunk_key(chunk_hash);
        let bytes = self
            .op
            .read(&key)
            .await
            .with_context(|| format!("reading chunk: {key}"))?;
        Ok(bytes.to_vec())
    }

    /// Store a chunk received from a peer. Returns `false` (and stores
    /// nothing) when the bytes do not hash to `chunk_hash`.
    pub async fn put_chunk(&self, chunk_hash: &str, data: &[u8]) -> Result<bool> {
        if !tandem_chunks::verify_hex(data, chunk_hash) {
            debug!(chunk = %chunk_hash, "chunk hash mismatch, discarded");
            return Ok(false);
        }
        let key = chunk_key(chunk_hash);
        self.op
            .write(&key, data.to_vec())
            .await
            .with_context(|| format!("writing chunk: {key}"))?;
        Ok(true)
    }

    /// Publish a manifest once every chunk is present and the reassembled
    /// payload matches the content hash.
    pub async fn complete(&self, manifest: &AttachmentManifest) -> Result<()> {
        if manifest.size > manifest.max_size() {
            anyhow::bail!(
                "attachment {} claims {} bytes in {} chunks",
                manifest.content_hash,
                manifest.size,
                manifest.chunk_count()
            );
        }
        let mut assembled = Vec::with_capacity(manifest.reassembly_capacity());
        for chunk_hex in &manifest.chunks {
            if !self.has_chunk(chunk_hex).await? {
                anyhow::bail!(
                    "attachment {} incomplete: chunk {chunk_hex} missing",
                    manifest.content_hash
                );
            }
            assembled.extend_from_slice(&self.read_chunk(chunk_hex).await?);
        }
        if assembled.len() as u64 != manifest.size
            || !tandem_chunks::verify_hex(&assembled, &manifest.content_hash)
        {
            anyhow::bail!(
                "attachment {} does not match its manifest",
                manifest.content_hash
            );
        }
        self.put_manifest(manifest).await
    }

    /// Persisted per-attachment sync tiers.
    pub async fn load_tiers(&self) -> Result<BTreeMap<String, SyncTier>> {
        if !self.op.exists(TIERS_KEY).await.context("checking tier table")? {
            return Ok(BTreeMap::new());
        }
        let bytes = self.op.read(TIERS_KEY).await.context("reading tier table")?;
        serde_json::from_slice(&bytes.to_vec()).context("parsing tier table")
    }

    pub async fn save_tiers(&self, tiers: &BTreeMap<String, SyncTier>) -> Result<()> {
        let json = serde_json::to_vec(tiers).context("serializing tier table")?;
        self.op
            .write(TIERS_KEY, json)
            .await
            .context("writing tier table")?;
        Ok(())
    }

    async fn put_manifest(&self, manifest: &AttachmentManifest) -> Result<()> {
        let key = manifest_key(&manifest.content_hash);
        self.op
            .write(&key, manifest.to_bytes()?)
            .await
            .with_context(|| format!("writing manifest: {key}"))?;
        Ok(())
    }
}

fn chunk_key(chunk_hash: &str) -> String {
    format!("chunks/{chunk_hash}")
}

fn manifest_key(content_hash: &str) -> String {
    format!("manifests/{content_hash}")
}
