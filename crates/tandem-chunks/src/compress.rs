//! zstd compression for wire frames
//!
//! Catch-up batches are JSON and compress well; the codec compresses any
//! frame above a threshold and marks it with a flag bit. Decompression is
//! bounded so a hostile peer cannot expand a small frame without limit.

use anyhow::{Context, Result};

/// Largest decompressed frame accepted from a peer (64 MiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Compression level used for wire frames
pub const FRAME_LEVEL: i32 = 3;

/// Compress one frame payload.
pub fn compress_frame(data: &[u8]) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, FRAME_LEVEL).context("zstd compress frame")
}

/// Decompress one frame payload, refusing output larger than `MAX_FRAME_BYTES`.
pub fn decompress_frame(data: &[u8]) -> Result<Vec<u8>> {
    zstd::bulk::decompress(data, MAX_FRAME_BYTES).context("zstd decompress frame")
}
