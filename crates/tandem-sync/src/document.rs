//! Document engine: deterministic merge of every change targeting one entity.
//!
//! State is a pure function of the set of applied changes. Each field type
//! keeps the raw facts (who wrote what, who observed what) in ordered maps
//! and derives the visible value on read, so application order never
//! matters and re-applying a change is a no-op.
//!
//! Entity existence is tombstone-wins: the entity is deleted while any
//! delete has not been observed by a restore. Changes keep landing in the
//! retained sub-state of a deleted entity, so a later restore loses nothing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use tandem_core::types::FieldKind;
use tandem_core::{ChangeId, EntityId, FieldStrategy, TandemError, TandemResult};

use crate::change::{AttachmentRef, Change, Mutation, Operation};
use crate::clock::VectorClock;
use crate::policy::{resolve_field, Candidate, FieldConflict, PolicyTable, Resolution};
use crate::position::Position;

// ── Register ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegisterEntry {
    value: Value,
    timestamp: u64,
}

/// Multi-value register. A write supersedes the values its author saw;
/// whatever is left unsuperseded is concurrent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Register {
    entries: BTreeMap<ChangeId, RegisterEntry>,
    superseded: BTreeSet<ChangeId>,
}

impl Register {
    fn write(
        &mut self,
        id: &ChangeId,
        value: Value,
        timestamp: u64,
        supersedes: &BTreeSet<ChangeId>,
    ) {
        self.entries
            .insert(id.clone(), RegisterEntry { value, timestamp });
        self.superseded.extend(supersedes.iter().cloned());
    }

    pub fn live(&self) -> Vec<Candidate> {
        self.entries
            .iter()
            .filter(|(id, _)| !self.superseded.contains(*id))
            .map(|(id, e)| Candidate {
                id: id.clone(),
                value: e.value.clone(),
                timestamp: e.timestamp,
            })
            .collect()
    }

    fn live_ids(&self) -> BTreeSet<ChangeId> {
        self.entries
            .keys()
            .filter(|id| !self.superseded.contains(*id))
            .cloned()
            .collect()
    }

    fn purge(&mut self, stable: &VectorClock) -> usize {
        let dead: Vec<ChangeId> = self
            .superseded
            .iter()
            .filter(|id| stable.contains(id) && self.entries.contains_key(*id))
            .cloned()
            .collect();
        for id in &dead {
            self.entries.remove(id);
            self.superseded.remove(id);
        }
        dead.len()
    }
}

// ── Observed-remove set ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Element {
    adds: BTreeSet<ChangeId>,
    removes: BTreeSet<ChangeId>,
    /// Adds observed by some remove
    dead_adds: BTreeSet<ChangeId>,
    /// Removes observed by some add
    dead_removes: BTreeSet<ChangeId>,
}

impl Element {
    fn has_live_add(&self) -> bool {
        self.adds.iter().any(|a| !self.dead_adds.contains(a))
    }

    fn has_live_remove(&self) -> bool {
        self.removes.iter().any(|r| !self.dead_removes.contains(r))
    }

    fn present(&self, strategy: FieldStrategy) -> bool {
        match strategy {
            FieldStrategy::RemoveWins => self.has_live_add() && !self.has_live_remove(),
            _ => self.has_live_add(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrSet {
    elements: BTreeMap<String, Element>,
}

impl OrSet {
    pub fn contains(&self, element: &str, strategy: FieldStrategy) -> bool {
        self.elements
            .get(element)
            .is_some_and(|e| e.present(strategy))
    }

    pub fn members(&self, strategy: FieldStrategy) -> Vec<&str> {
        self.elements
            .iter()
            .filter(|(_, e)| e.present(strategy))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    fn known_adds(&self, element: &str) -> BTreeSet<ChangeId> {
        self.elements
            .get(element)
            .map(|e| e.adds.clone())
            .unwrap_or_default()
    }

    fn known_removes(&self, element: &str) -> BTreeSet<ChangeId> {
        self.elements
            .get(element)
            .map(|e| e.removes.clone())
            .unwrap_or_default()
    }

    fn purge(&mut self, stable: &VectorClock) -> usize {
        let before = self.elements.len();
        self.elements.retain(|_, e| {
            e.has_live_add()
                || !e.adds.iter().chain(e.removes.iter()).all(|id| stable.contains(id))
        });
        before - self.elements.len()
    }
}

// ── Sequence ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SequenceEntry {
    value: Value,
    inserted_by: ChangeId,
}

/// Ordered list keyed by dense positions. Removed positions are remembered
/// even when the insert has not arrived yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(with = "pairs")]
    elements: BTreeMap<Position, SequenceEntry>,
    /// position -> smallest removing change
    #[serde(with = "pairs")]
    removed: BTreeMap<Position, ChangeId>,
}

impl Sequence {
    fn visible(&self) -> impl Iterator<Item = (&Position, &SequenceEntry)> {
        self.elements
            .iter()
            .filter(|(p, _)| !self.removed.contains_key(*p))
    }

    pub fn len(&self) -> usize {
        self.visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<Value> {
        self.visible().map(|(_, e)| e.value.clone()).collect()
    }

    fn position_at(&self, index: usize) -> Option<&Position> {
        self.visible().nth(index).map(|(p, _)| p)
    }

    fn tombstones(&self) -> usize {
        self.removed.len()
    }

    fn purge(&mut self, stable: &VectorClock) -> usize {
        let dead: Vec<Position> = self
            .removed
            .iter()
            .filter(|(_, by)| stable.contains(by))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &dead {
            self.removed.remove(p);
            self.elements.remove(p);
        }
        dead.len()
    }
}

/// Serialize a map with non-string keys as a list of pairs.
mod pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let pairs: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ── Document ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    entity: EntityId,
    registers: BTreeMap<String, Register>,
    sets: BTreeMap<String, OrSet>,
    sequences: BTreeMap<String, Sequence>,
    deletes: BTreeSet<ChangeId>,
    /// Deletes observed by some restore
    restored: BTreeSet<ChangeId>,
    /// content hash -> reference
    attachments: BTreeMap<String, AttachmentRef>,
    applied: BTreeSet<ChangeId>,
}

impl Document {
    pub fn new(entity: EntityId) -> Self {
        Document {
            entity,
            registers: BTreeMap::new(),
            sets: BTreeMap::new(),
            sequences: BTreeMap::new(),
            deletes: BTreeSet::new(),
            restored: BTreeSet::new(),
            attachments: BTreeMap::new(),
            applied: BTreeSet::new(),
        }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn has_applied(&self, id: &ChangeId) -> bool {
        self.applied.contains(id)
    }

    /// Merge one change. Returns `false` when the change was already applied.
    pub fn apply(&mut self, change: &Change) -> bool {
        if !self.applied.insert(change.id.clone()) {
            return false;
        }
        let id = &change.id;

        match &change.op {
            Operation::SetField {
                field,
                value,
                supersedes,
            } => {
                self.registers.entry(field.clone()).or_default().write(
                    id,
                    value.clone(),
                    change.timestamp,
                    supersedes,
                );
            }
            Operation::Attach {
                field,
                attachment,
                supersedes,
            } => {
                let value = json!({
                    "content_hash": attachment.content_hash,
                    "size": attachment.size,
                    "media_type": attachment.media_type,
                });
                self.registers.entry(field.clone()).or_default().write(
                    id,
                    value,
                    change.timestamp,
                    supersedes,
                );
                self.attachments
                    .insert(attachment.content_hash.clone(), attachment.clone());
            }
            Operation::SetAdd {
                field,
                element,
                observed,
            } => {
                let e = self
                    .sets
                    .entry(field.clone())
                    .or_default()
                    .elements
                    .entry(element.clone())
                    .or_default();
                e.adds.insert(id.clone());
                e.dead_removes.extend(observed.iter().cloned());
            }
            Operation::SetRemove {
                field,
                element,
                observed,
            } => {
                let e = self
                    .sets
                    .entry(field.clone())
                    .or_default()
                    .elements
                    .entry(element.clone())
                    .or_default();
                e.removes.insert(id.clone());
                e.dead_adds.extend(observed.iter().cloned());
            }
            Operation::SeqInsert {
                field,
                position,
                value,
            } => {
                self.sequences.entry(field.clone()).or_default().elements.insert(
                    position.clone(),
                    SequenceEntry {
                        value: value.clone(),
                        inserted_by: id.clone(),
                    },
                );
            }
            Operation::SeqRemove { field, position } => {
                let seq = self.sequences.entry(field.clone()).or_default();
                let by = seq.removed.entry(position.clone()).or_insert_with(|| id.clone());
                if *id < *by {
                    *by = id.clone();
                }
            }
            Operation::Delete => {
                self.deletes.insert(id.clone());
            }
            Operation::Restore { observed } => {
                self.restored.extend(observed.iter().cloned());
            }
        }
        true
    }

    pub fn is_deleted(&self) -> bool {
        self.deletes.iter().any(|d| !self.restored.contains(d))
    }

    /// Resolve one register field through the policy table.
    pub fn resolve(&self, field: &str, policy: &PolicyTable) -> Resolution {
        let strategy = policy.strategy(field, FieldKind::Register);
        match self.registers.get(field) {
            Some(reg) => resolve_field(strategy, reg.live()),
            None => Resolution::Unset,
        }
    }

    pub fn set_members(&self, field: &str, policy: &PolicyTable) -> Vec<String> {
        let strategy = policy.strategy(field, FieldKind::Set);
        self.sets
            .get(field)
            .map(|s| s.members(strategy).into_iter().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn sequence(&self, field: &str) -> Option<&Sequence> {
        self.sequences.get(field)
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentRef> {
        self.attachments.values()
    }

    /// The merged view, or `None` while the entity is deleted.
    pub fn materialize(&self, policy: &PolicyTable) -> Option<Value> {
        (!self.is_deleted()).then(|| self.materialize_retained(policy))
    }

    /// The merged view of the retained state, ignoring deletion.
    pub fn materialize_retained(&self, policy: &PolicyTable) -> Value {
        let mut out = Map::new();
        for field in self.registers.keys() {
            let value = match self.resolve(field, policy) {
                Resolution::Winner(c) => c.value,
                Resolution::Concurrent(cs) | Resolution::ManualReviewRequired(cs) => {
                    Value::Array(cs.into_iter().map(|c| c.value).collect())
                }
                Resolution::Unset | Resolution::Merged => continue,
            };
            out.insert(field.clone(), value);
        }
        for field in self.sets.keys() {
            let members = self
                .set_members(field, policy)
                .into_iter()
                .map(Value::String)
                .collect();
            out.insert(field.clone(), Value::Array(members));
        }
        for (field, seq) in &self.sequences {
            out.insert(field.clone(), Value::Array(seq.values()));
        }
        Value::Object(out)
    }

    /// Register fields waiting on a manual decision.
    pub fn conflicts(&self, policy: &PolicyTable) -> Vec<FieldConflict> {
        self.registers
            .keys()
            .filter_map(|field| match self.resolve(field, policy) {
                Resolution::ManualReviewRequired(candidates) => Some(FieldConflict {
                    entity: self.entity.clone(),
                    field: field.clone(),
                    candidates,
                }),
                _ => None,
            })
            .collect()
    }

    /// BLAKE3 over the canonical encoding of the full merge state.
    pub fn state_hash(&self) -> TandemResult<tandem_chunks::Hash> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| TandemError::Codec(format!("encoding document {}: {e}", self.entity)))?;
        Ok(tandem_chunks::hash_bytes(&bytes))
    }

    /// Turn a caller's mutation into an operation authored as `id`,
    /// recording everything the author can currently see.
    pub fn prepare(&self, id: &ChangeId, mutation: Mutation) -> TandemResult<Operation> {
        let op = match mutation {
            Mutation::Set { field, value } => Operation::SetField {
                supersedes: self.live_register_ids(&field),
                field,
                value,
            },
            Mutation::Attach { field, attachment } => Operation::Attach {
                supersedes: self.live_register_ids(&field),
                field,
                attachment,
            },
            Mutation::Add { field, element } => Operation::SetAdd {
                observed: self
                    .sets
                    .get(&field)
                    .map(|s| s.known_removes(&element))
                    .unwrap_or_default(),
                field,
                element,
            },
            Mutation::Remove { field, element } => Operation::SetRemove {
                observed: self
                    .sets
                    .get(&field)
                    .map(|s| s.known_adds(&element))
                    .unwrap_or_default(),
                field,
                element,
            },
            Mutation::Insert {
                field,
                index,
                value,
            } => {
                let seq = self.sequences.get(&field);
                let len = seq.map_or(0, Sequence::len);
                if index > len {
                    return Err(TandemError::malformed(
                        id,
                        format!("insert at {index} past the end of '{field}' (len {len})"),
                    ));
                }
                let left = index
                    .checked_sub(1)
                    .and_then(|i| seq.and_then(|s| s.position_at(i)));
                let right = seq.and_then(|s| s.position_at(index));
                Operation::SeqInsert {
                    position: Position::between(left, right, &id.actor, id.seq),
                    field,
                    value,
                }
            }
            Mutation::RemoveAt { field, index } => {
                let position = self
                    .sequences
                    .get(&field)
                    .and_then(|s| s.position_at(index))
                    .cloned()
                    .ok_or_else(|| {
                        TandemError::malformed(id, format!("no element {index} in '{field}'"))
                    })?;
                Operation::SeqRemove { field, position }
            }
            Mutation::Delete => Operation::Delete,
            Mutation::Restore => Operation::Restore {
                observed: self.deletes.clone(),
            },
        };
        Ok(op)
    }

    fn live_register_ids(&self, field: &str) -> BTreeSet<ChangeId> {
        self.registers
            .get(field)
            .map(Register::live_ids)
            .unwrap_or_default()
    }

    /// Number of retained deletion markers of any kind.
    pub fn tombstone_count(&self) -> usize {
        let seq: usize = self.sequences.values().map(Sequence::tombstones).sum();
        let set: usize = self
            .sets
            .values()
            .flat_map(|s| s.elements.values())
            .filter(|e| !e.has_live_add())
            .count();
        let reg: usize = self.registers.values().map(|r| r.superseded.len()).sum();
        seq + set + reg + self.deletes.len()
    }

    /// Drop tombstones whose deciding change is covered by `stable`, the
    /// clock every live peer is known to have reached.
    pub fn purge(&mut self, stable: &VectorClock) -> usize {
        let mut purged = 0;
        for reg in self.registers.values_mut() {
            purged += reg.purge(stable);
        }
        for set in self.sets.values_mut() {
            purged += set.purge(stable);
        }
        for seq in self.sequences.values_mut() {
            purged += seq.purge(stable);
        }
        purged
    }
}
