//! Wire messages and frame codec.
//!
//! Frame layout:
//!   [u32 BE payload length][u8 flags][payload]
//! flags bit 0 set = payload is zstd-compressed. The payload is one JSON
//! encoded `Message`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

use tandem_chunks::MAX_FRAME_BYTES;
use tandem_core::{ActorId, ChangeId, EntityId, TandemError};

use crate::change::Change;
use crate::clock::VectorClock;
use crate::index::{IndexNode, NodeId};

pub const PROTOCOL_VERSION: u32 = 1;

const HEADER_LEN: usize = 5;
const FLAG_ZSTD: u8 = 0b0000_0001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        protocol_version: u32,
        actor_id: ActorId,
        /// Per-entity divergence index roots (hex)
        root_hashes: BTreeMap<EntityId, String>,
        clock: VectorClock,
        index_depth: u8,
    },
    IndexQuery {
        entity: EntityId,
        nodes: Vec<NodeId>,
    },
    IndexNodes {
        entity: EntityId,
        nodes: Vec<IndexNode>,
    },
    DeltaRequest {
        missing_change_ids: Vec<ChangeId>,
    },
    DeltaBatch {
        /// Dependency order
        changes: Vec<Change>,
        is_final: bool,
    },
    /// Combined root after catch-up.
    Verify {
        root_hash: String,
    },
    UpdateChange {
        change: Change,
    },
    /// A change the receiver refused as malformed.
    Reject {
        change_id: ChangeId,
        reason: String,
    },
    AttachmentManifestRequest {
        content_hash: String,
    },
    AttachmentManifest {
        content_hash: String,
        size: u64,
        chunks: Vec<String>,
    },
    AttachmentUnavailable {
        content_hash: String,
    },
    AttachmentChunkRequest {
        content_hash: String,
        chunk_index: u32,
    },
    AttachmentChunk {
        content_hash: String,
        chunk_index: u32,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        chunk_hash: String,
    },
    Goodbye,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::IndexQuery { .. } => "index_query",
            Message::IndexNodes { .. } => "index_nodes",
            Message::DeltaRequest { .. } => "delta_request",
            Message::DeltaBatch { .. } => "delta_batch",
            Message::Verify { .. } => "verify",
            Message::UpdateChange { .. } => "update_change",
            Message::Reject { .. } => "reject",
            Message::AttachmentManifestRequest { .. } => "attachment_manifest_request",
            Message::AttachmentManifest { .. } => "attachment_manifest",
            Message::AttachmentUnavailable { .. } => "attachment_unavailable",
            Message::AttachmentChunkRequest { .. } => "attachment_chunk_request",
            Message::AttachmentChunk { .. } => "attachment_chunk",
            Message::Goodbye => "goodbye",
        }
    }

    /// Attachment transfer messages are routed to the selective sync
    /// manager instead of the session state machine.
    pub fn is_attachment_reply(&self) -> bool {
        matches!(
            self,
            Message::AttachmentManifest { .. }
                | Message::AttachmentUnavailable { .. }
                | Message::AttachmentChunk { .. }
        )
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ── Frame codec ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FrameCodec {
    compress_threshold: usize,
}

impl FrameCodec {
    pub fn new(compress_threshold: usize) -> Self {
        Self { compress_threshold }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = TandemError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TandemError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(TandemError::Codec(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let flags = src.get_u8();
        let payload = src.split_to(len);

        let json = if flags & FLAG_ZSTD != 0 {
            tandem_chunks::decompress_frame(&payload)
                .map_err(|e| TandemError::Codec(format!("{e:#}")))?
        } else {
            payload.to_vec()
        };
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| TandemError::Codec(format!("decoding message: {e}")))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = TandemError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TandemError> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| TandemError::Codec(format!("encoding {}: {e}", item.kind())))?;

        let (flags, payload) = if json.len() > self.compress_threshold {
            let packed = tandem_chunks::compress_frame(&json)
                .map_err(|e| TandemError::Codec(format!("{e:#}")))?;
            (FLAG_ZSTD, packed)
        } else {
            (0, json)
        };
        if payload.len() > MAX_FRAME_BYTES {
            return Err(TandemError::Codec(format!(
                "{} frame of {} bytes exceeds limit",
                item.kind(),
                payload.len()
            )));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_u8(flags);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
