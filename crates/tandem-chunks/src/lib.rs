//! tandem-chunks: content addressing for the sync engine
//!
//! # Overview
//! - `blake3`: content hashes for changes, index nodes and attachments
//! - `fastcdc`: content-defined chunking of attachment payloads
//! - `compress`: zstd frame compression for wire batches

pub mod blake3;
pub mod compress;
pub mod fastcdc;

pub use blake3::{hash_bytes, hash_from_hex, hash_parts, hash_to_hex, verify_hex, zero_hash, Hash};
pub use compress::{compress_frame, decompress_frame, MAX_FRAME_BYTES};
pub use fastcdc::{chunk_data, Chunk, ChunkSizes};
