use thiserror::Error;

pub type TandemResult<T> = Result<T, TandemError>;

#[derive(Debug, Error)]
pub enum TandemError {
    #[error("malformed change {change}: {reason}")]
    MalformedChange { change: String, reason: String },

    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("root hash mismatch after catch-up (local {local}, remote {remote})")]
    ChecksumMismatch { local: String, remote: String },

    /// The durable change log failed validation. The replica must be
    /// re-bootstrapped from a peer.
    #[error("change log corrupted: {0}")]
    CorruptLog(String),

    #[error("pending buffer overflow ({0} changes waiting on dependencies)")]
    PendingOverflow(usize),

    /// Tombstones the peer never saw were collected while it was away, and
    /// it still holds changes this replica lacks.
    #[error("peer {0} must bootstrap from a fresh replica")]
    BootstrapRequired(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("attachment {0} is metadata-only on this replica")]
    TierForbidsTransfer(String),

    #[error("attachment {0} not available")]
    AttachmentNotFound(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TandemError {
    pub fn malformed(change: impl ToString, reason: impl Into<String>) -> Self {
        TandemError::MalformedChange {
            change: change.to_string(),
            reason: reason.into(),
        }
    }

    /// Everything except a corrupted change log can be retried or recovered
    /// locally.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TandemError::CorruptLog(_))
    }
}
