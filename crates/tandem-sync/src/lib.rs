//! tandem-sync: offline-first replication of structured documents.
//!
//! Each replica keeps an append-only causal change log, merges documents
//! with per-field strategies, and reconciles with peers through a
//! divergence index so a session only moves the changes the other side
//! lacks.

pub mod attachments;
pub mod change;
pub mod clock;
pub mod document;
pub mod gc;
pub mod identity;
pub mod index;
pub mod log;
pub mod manager;
pub mod peers;
pub mod pending;
pub mod policy;
pub mod position;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod store;
pub mod transport;

pub use attachments::{ChunkSource, SelectiveSync};
pub use change::{AttachmentRef, Change, Mutation, Operation};
pub use clock::{CausalOrder, ManualClock, SystemClock, VectorClock, WallClock};
pub use document::Document;
pub use identity::ReplicaIdentity;
pub use manager::{Backoff, SyncManager};
pub use peers::SyncStatus;
pub use policy::{FieldConflict, PolicyTable, Resolution};
pub use protocol::{FrameCodec, Message, PROTOCOL_VERSION};
pub use replica::{ApplyOutcome, Replica, ReplicaOptions, ReplicaStats};
pub use session::{run_session, PeerLink, SessionConfig, SessionState, SyncCounters};
pub use store::{open_store, ChangeStore, JsonStore, MemoryStore};
pub use transport::{MemoryTransport, TcpTransport, Transport};
