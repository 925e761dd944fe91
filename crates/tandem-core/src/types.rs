use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Stable identity of one replica (one device installation).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        ActorId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        ActorId(s.to_string())
    }
}

/// Logical entity a change targets (a session, a message, a settings map).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

/// `(actor, sequence_number)`: globally unique, never reused.
///
/// Serialized as the string `"{actor}:{seq}"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeId {
    pub actor: ActorId,
    pub seq: u64,
}

impl ChangeId {
    pub fn new(actor: ActorId, seq: u64) -> Self {
        ChangeId { actor, seq }
    }

    /// The previous change by the same actor, if any.
    pub fn predecessor(&self) -> Option<ChangeId> {
        (self.seq > 1).then(|| ChangeId::new(self.actor.clone(), self.seq - 1))
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor, self.seq)
    }
}

impl FromStr for ChangeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (actor, seq) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("change id '{s}' has no ':' separator"))?;
        if actor.is_empty() {
            return Err(format!("change id '{s}' has an empty actor"));
        }
        let seq = seq
            .parse::<u64>()
            .map_err(|e| format!("change id '{s}' has a bad sequence number: {e}"))?;
        Ok(ChangeId::new(ActorId::new(actor), seq))
    }
}

impl Serialize for ChangeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Shape of a document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Register,
    Set,
    Sequence,
}

/// Merge strategy for one field, taken from the `[fields]` policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStrategy {
    /// Register resolved by `(timestamp, actor)`.
    #[serde(alias = "last_writer_wins")]
    Lww,
    /// Register keeping every concurrent value until one is picked.
    MultiValue,
    /// Register whose concurrent values require manual review.
    Exclusive,
    /// Observed-remove set; a concurrent add and remove leaves the element.
    AddWins,
    /// Observed-remove set; a concurrent add and remove drops the element.
    RemoveWins,
    /// Ordered list with fractional positions.
    Sequence,
}

impl FieldStrategy {
    pub fn kind(self) -> FieldKind {
        match self {
            FieldStrategy::Lww | FieldStrategy::MultiValue | FieldStrategy::Exclusive => {
                FieldKind::Register
            }
            FieldStrategy::AddWins | FieldStrategy::RemoveWins => FieldKind::Set,
            FieldStrategy::Sequence => FieldKind::Sequence,
        }
    }

    /// Strategy used for a field that has no policy table entry.
    pub fn default_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Register => FieldStrategy::Lww,
            FieldKind::Set => FieldStrategy::AddWins,
            FieldKind::Sequence => FieldStrategy::Sequence,
        }
    }
}

/// Replication tier of an attachment's binary payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTier {
    /// Only content hash, size and owner replicate.
    MetadataOnly,
    /// Payload is fetched when requested.
    #[default]
    OnDemand,
    /// Payload is fetched as soon as the metadata arrives.
    Always,
}
