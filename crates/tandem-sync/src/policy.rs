//! Per-field conflict resolution policy.
//!
//! The policy table (`field name -> strategy`) is fixed when a replica opens.
//! Set and sequence fields are merged by the document engine itself; only
//! register fields reach `resolve_field` with more than one live value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use tandem_core::types::FieldKind;
use tandem_core::{ChangeId, EntityId, FieldStrategy};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    fields: BTreeMap<String, FieldStrategy>,
}

impl PolicyTable {
    pub fn new(fields: BTreeMap<String, FieldStrategy>) -> Self {
        PolicyTable { fields }
    }

    pub fn set(&mut self, field: impl Into<String>, strategy: FieldStrategy) {
        self.fields.insert(field.into(), strategy);
    }

    /// Strategy for `field`. Fields missing from the table fall back to the
    /// default for the shape of operation touching them.
    pub fn strategy(&self, field: &str, kind: FieldKind) -> FieldStrategy {
        self.fields
            .get(field)
            .copied()
            .unwrap_or_else(|| FieldStrategy::default_for(kind))
    }
}

/// One live register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ChangeId,
    pub value: Value,
    pub timestamp: u64,
}

/// Outcome of resolving a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Nothing written yet.
    Unset,
    /// The document engine's CRDT merge is the answer.
    Merged,
    /// A single value stands.
    Winner(Candidate),
    /// Concurrent values kept side by side.
    Concurrent(Vec<Candidate>),
    /// Concurrent values that must not be auto-resolved. All are retained
    /// until a user picks one.
    ManualReviewRequired(Vec<Candidate>),
}

/// Resolve a field's concurrent values according to its strategy.
///
/// LWW orders by `(timestamp, actor, seq)`, so equal timestamps are won by
/// the lexicographically greater actor on every replica.
pub fn resolve_field(strategy: FieldStrategy, mut concurrent: Vec<Candidate>) -> Resolution {
    if strategy.kind() != FieldKind::Register {
        return Resolution::Merged;
    }
    if concurrent.len() <= 1 {
        return match concurrent.pop() {
            Some(only) => Resolution::Winner(only),
            None => Resolution::Unset,
        };
    }

    concurrent.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    match strategy {
        FieldStrategy::Exclusive => Resolution::ManualReviewRequired(concurrent),
        FieldStrategy::MultiValue => Resolution::Concurrent(concurrent),
        _ => match concurrent.pop() {
            Some(winner) => Resolution::Winner(winner),
            None => Resolution::Unset,
        },
    }
}

/// A field held for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub entity: EntityId,
    pub field: String,
    pub candidates: Vec<Candidate>,
}
