//! BLAKE3 content hashing
//!
//! Every content address in tandem (changes, hash-tree nodes, attachment
//! chunks and whole attachments) is a BLAKE3 digest, carried on the wire as
//! 64 lowercase hex chars.

use anyhow::Result;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// All-zero digest; marks an empty hash-tree node.
pub fn zero_hash() -> Hash {
    Hash::from([0u8; 32])
}

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Hash a sequence of parts, each length-prefixed so that
/// `["ab", "c"]` and `["a", "bc"]` never collide.
pub fn hash_parts<'a, I>(parts: I) -> Hash
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize()
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex).map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}

/// Check `data` against an expected hex digest. Malformed hex never verifies.
pub fn verify_hex(data: &[u8], expected_hex: &str) -> bool {
    match hash_from_hex(expected_hex) {
        // blake3::Hash equality is constant-time
        Ok(expected) => hash_bytes(data) == expected,
        Err(_) => false,
    }
}
