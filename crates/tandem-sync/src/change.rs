//! Change records: the atomic, immutable unit of replication.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use tandem_core::types::FieldKind;
use tandem_core::{ChangeId, EntityId, TandemError, TandemResult};

use crate::policy::PolicyTable;
use crate::position::Position;

/// Reference from a document field to a content-addressed attachment.
/// Only this metadata travels with the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// BLAKE3 of the payload (hex)
    pub content_hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// A stored, fully resolved operation. Every concurrency decision the author
/// made (which values it saw, where an element goes) is recorded in the
/// operation itself, so applying it never depends on local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Write a register, superseding the values the author could see.
    SetField {
        field: String,
        value: Value,
        #[serde(default)]
        supersedes: BTreeSet<ChangeId>,
    },
    /// Add an element; `observed` lists the removes of it the author saw.
    SetAdd {
        field: String,
        element: String,
        #[serde(default)]
        observed: BTreeSet<ChangeId>,
    },
    /// Remove an element; `observed` lists the adds of it the author saw.
    SetRemove {
        field: String,
        element: String,
        #[serde(default)]
        observed: BTreeSet<ChangeId>,
    },
    SeqInsert {
        field: String,
        position: Position,
        value: Value,
    },
    SeqRemove {
        field: String,
        position: Position,
    },
    /// Tombstone the whole entity.
    Delete,
    /// Undo the deletes the author saw.
    Restore {
        #[serde(default)]
        observed: BTreeSet<ChangeId>,
    },
    /// Point a register field at an attachment.
    Attach {
        field: String,
        attachment: AttachmentRef,
        #[serde(default)]
        supersedes: BTreeSet<ChangeId>,
    },
}

impl Operation {
    pub fn field(&self) -> Option<&str> {
        match self {
            Operation::SetField { field, .. }
            | Operation::SetAdd { field, .. }
            | Operation::SetRemove { field, .. }
            | Operation::SeqInsert { field, .. }
            | Operation::SeqRemove { field, .. }
            | Operation::Attach { field, .. } => Some(field),
            Operation::Delete | Operation::Restore { .. } => None,
        }
    }

    pub fn field_kind(&self) -> Option<FieldKind> {
        match self {
            Operation::SetField { .. } | Operation::Attach { .. } => Some(FieldKind::Register),
            Operation::SetAdd { .. } | Operation::SetRemove { .. } => Some(FieldKind::Set),
            Operation::SeqInsert { .. } | Operation::SeqRemove { .. } => Some(FieldKind::Sequence),
            Operation::Delete | Operation::Restore { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::SetField { .. } => "set_field",
            Operation::SetAdd { .. } => "set_add",
            Operation::SetRemove { .. } => "set_remove",
            Operation::SeqInsert { .. } => "seq_insert",
            Operation::SeqRemove { .. } => "seq_remove",
            Operation::Delete => "delete",
            Operation::Restore { .. } => "restore",
            Operation::Attach { .. } => "attach",
        }
    }
}

/// What a caller asks for. The replica turns a mutation into an
/// `Operation` against its current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set { field: String, value: Value },
    Add { field: String, element: String },
    Remove { field: String, element: String },
    Insert { field: String, index: usize, value: Value },
    RemoveAt { field: String, index: usize },
    Delete,
    Restore,
    Attach { field: String, attachment: AttachmentRef },
}

impl Mutation {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Mutation::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn add(field: impl Into<String>, element: impl Into<String>) -> Self {
        Mutation::Add {
            field: field.into(),
            element: element.into(),
        }
    }

    pub fn remove(field: impl Into<String>, element: impl Into<String>) -> Self {
        Mutation::Remove {
            field: field.into(),
            element: element.into(),
        }
    }

    pub fn insert(field: impl Into<String>, index: usize, value: impl Into<Value>) -> Self {
        Mutation::Insert {
            field: field.into(),
            index,
            value: value.into(),
        }
    }

    pub fn remove_at(field: impl Into<String>, index: usize) -> Self {
        Mutation::RemoveAt {
            field: field.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    /// Causal predecessors known to the author
    #[serde(default)]
    pub deps: BTreeSet<ChangeId>,
    pub entity: EntityId,
    pub op: Operation,
    /// Hybrid wall-clock milliseconds; LWW ordering key
    pub timestamp: u64,
}

impl Change {
    /// BLAKE3 of the canonical JSON encoding.
    pub fn content_hash(&self) -> TandemResult<tandem_chunks::Hash> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| TandemError::Codec(format!("encoding change {}: {e}", self.id)))?;
        Ok(tandem_chunks::hash_bytes(&bytes))
    }

    /// Structural checks applied before a change is accepted from anyone.
    pub fn validate(&self, policy: &PolicyTable) -> TandemResult<()> {
        let reject = |reason: String| Err(TandemError::malformed(&self.id, reason));

        if self.id.seq == 0 {
            return reject("sequence numbers start at 1".into());
        }
        if self.id.actor.as_str().is_empty() {
            return reject("empty actor id".into());
        }
        if self.entity.as_str().is_empty() {
            return reject("empty entity id".into());
        }
        if self.deps.contains(&self.id) {
            return reject("change depends on itself".into());
        }
        if let Some(dep) = self
            .deps
            .iter()
            .find(|d| d.actor == self.id.actor && d.seq >= self.id.seq)
        {
            return reject(format!("depends on later change {dep} by the same actor"));
        }
        if let Some(pred) = self.id.predecessor() {
            if !self.deps.contains(&pred) {
                return reject(format!("missing dependency on predecessor {pred}"));
            }
        }

        if let (Some(field), Some(kind)) = (self.op.field(), self.op.field_kind()) {
            if field.is_empty() {
                return reject(format!("{} with an empty field name", self.op.name()));
            }
            let strategy = policy.strategy(field, kind);
            if strategy.kind() != kind {
                return reject(format!(
                    "{} on field '{field}' whose policy is {strategy:?}",
                    self.op.name()
                ));
            }
        }

        match &self.op {
            Operation::SeqInsert { position, .. } => match position.origin() {
                Some(o) if o.actor == self.id.actor && o.seq == self.id.seq && o.digit > 0 => {}
                _ => return reject(format!("position {position} was not minted by this change")),
            },
            Operation::Attach { attachment, .. } => {
                if tandem_chunks::hash_from_hex(&attachment.content_hash).is_err() {
                    return reject(format!(
                        "attachment hash '{}' is not BLAKE3 hex",
                        attachment.content_hash
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}
