use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::{FieldStrategy, SyncTier};

/// Top-level configuration (loaded from tandem.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub daemon: DaemonConfig,
    pub replica: ReplicaConfig,
    pub sync: SyncConfig,
    pub index: IndexConfig,
    pub attachments: AttachmentConfig,
    /// Declarative merge policy: field name → strategy
    pub fields: BTreeMap<String, FieldStrategy>,
}

impl TandemConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, crate::TandemError> {
        toml::from_str(text).map_err(|e| crate::TandemError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP listen address for inbound peer sessions
    pub listen: Option<String>,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9464)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Directory holding the change log, peer state and snapshot
    pub data_dir: PathBuf,
    /// Actor identity file; created at first launch
    pub identity_file: Option<PathBuf>,
    /// Human-readable device name (defaults to hostname)
    pub device_name: Option<String>,
    /// Change log backend: "json" or "rocksdb"
    pub store: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Peers to dial, as host:port
    pub peers: Vec<String>,
    /// Timeout for the capability exchange phase
    pub hello_timeout_ms: u64,
    /// Timeout for the catch-up phase
    pub catchup_timeout_ms: u64,
    /// Timeout for a single attachment chunk round trip
    pub chunk_timeout_ms: u64,
    /// First reconnect delay after a failed session
    pub backoff_initial_ms: u64,
    /// Reconnect delay ceiling
    pub backoff_max_ms: u64,
    /// Changes held while waiting on dependencies before falling back to a full resync
    pub max_pending_changes: usize,
    /// Changes per DeltaBatch frame
    pub max_batch_changes: usize,
    /// Frames larger than this are zstd-compressed
    pub compress_threshold_bytes: usize,
    /// Consecutive post-catch-up checksum failures before a session gives up
    pub max_checksum_failures: u32,
    /// A peer silent for longer than this no longer holds back tombstone GC
    pub peer_expiry_secs: u64,
    /// Interval between tombstone GC passes
    pub gc_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Hash tree depth (fan-out 16 per level)
    pub depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// Filesystem root for attachment chunks (empty = in-memory)
    pub root: Option<PathBuf>,
    /// Tier assigned to attachments learned from peers
    pub default_tier: SyncTier,
    /// Re-requests of a single chunk before the transfer is abandoned
    pub max_chunk_retries: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: Some("0.0.0.0:7461".into()),
            metrics_addr: Some("127.0.0.1:9464".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.local/share/tandem"),
            identity_file: None,
            device_name: None,
            store: "json".into(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            hello_timeout_ms: 10_000,
            catchup_timeout_ms: 120_000,
            chunk_timeout_ms: 30_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 60_000,
            max_pending_changes: 10_000,
            max_batch_changes: 256,
            compress_threshold_bytes: 1024,
            max_checksum_failures: 3,
            peer_expiry_secs: 30 * 24 * 3600,
            gc_interval_secs: 3600,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { depth: 3 }
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            root: None,
            default_tier: SyncTier::OnDemand,
            max_chunk_retries: 5,
        }
    }
}
