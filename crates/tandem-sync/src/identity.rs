//! Replica identity, assigned once at first launch.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use tandem_core::ActorId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaIdentity {
    pub actor_id: ActorId,
    /// Human-readable device name
    pub name: String,
    /// Unix seconds at creation
    pub created_at: u64,
}

impl ReplicaIdentity {
    /// A fresh identity with a random UUID v4 actor id.
    pub fn generate(name: impl Into<String>) -> Self {
        ReplicaIdentity {
            actor_id: ActorId::new(uuid::Uuid::new_v4().to_string()),
            name: name.into(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Fixed identity, for tests and simulations.
    pub fn with_actor(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        ReplicaIdentity {
            name: actor.clone(),
            actor_id: ActorId::new(actor),
            created_at: 0,
        }
    }

    /// Load the identity at `path`, creating it on first launch. An existing
    /// identity is never rewritten; `name` only applies to a new one.
    pub fn load_or_create(path: &Path, name: &str) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading identity: {}", path.display()))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("parsing identity: {}", path.display()));
        }

        let identity = Self::generate(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(&identity).context("serializing identity")?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing identity temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming identity: {}", path.display()))?;

        info!(actor = %identity.actor_id, name = %identity.name, "created replica identity");
        Ok(identity)
    }
}
