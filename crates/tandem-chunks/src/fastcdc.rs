//! FastCDC content-defined chunking for attachment payloads
//!
//! Boundaries depend on content, so an attachment that is re-sent after an
//! interruption (or edited near the start) keeps most of its chunk hashes and
//! only the missing chunks travel again.
//!
//! Chunk size targets:
//!   - `SMALL`: min 2KB, avg 4KB, max 16KB (notes, thumbnails)
//!   - `MEDIA`: min 64KB, avg 256KB, max 1MB (audio, images, video)

use rayon::prelude::*;

/// A single content-defined chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the payload
    pub offset: u64,
    /// Chunk length in bytes
    pub length: usize,
    /// BLAKE3 hash of this chunk's data
    pub hash: crate::blake3::Hash,
}

impl Chunk {
    /// The chunk's bytes within the payload it was cut from.
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        &data[start..start + self.length]
    }
}

/// Chunk size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkSizes {
    pub const SMALL: ChunkSizes = ChunkSizes {
        min_size: 2 * 1024,
        avg_size: 4 * 1024,
        max_size: 16 * 1024,
    };

    pub const MEDIA: ChunkSizes = ChunkSizes {
        min_size: 64 * 1024,
        avg_size: 256 * 1024,
        max_size: 1024 * 1024,
    };

    /// Pick sizes from the payload length: small payloads get small chunks so
    /// that a resume still has something to skip.
    pub fn for_len(len: usize) -> Self {
        if len >= 16 * 1024 * 1024 {
            Self::MEDIA
        } else {
            Self::SMALL
        }
    }
}

/// Split `data` into content-defined chunks using FastCDC.
///
/// Boundaries are found sequentially; chunk hashes are computed in parallel.
/// For empty data, returns an empty list.
pub fn chunk_data(data: &[u8], sizes: ChunkSizes) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![];
    }

    let bounds: Vec<(usize, usize)> =
        fastcdc::v2020::FastCDC::new(data, sizes.min_size, sizes.avg_size, sizes.max_size)
            .map(|c| (c.offset, c.length))
            .collect();

    let chunks: Vec<Chunk> = bounds
        .par_iter()
        .map(|&(offset, length)| Chunk {
            offset: offset as u64,
            length,
            hash: crate::blake3::hash_bytes(&data[offset..offset + length]),
        })
        .collect();

    tracing::trace!(bytes = data.len(), chunks = chunks.len(), "chunked payload");
    chunks
}
