pub mod config;
pub mod error;
pub mod types;

pub use error::{TandemError, TandemResult};
pub use types::{ActorId, ChangeId, EntityId, FieldStrategy, SyncTier};
