//! In-memory view of the append-only change log.
//!
//! Changes are kept in the order they were applied, which is always a
//! causal order: nothing is appended before its dependencies.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tandem_core::{ActorId, ChangeId, TandemError, TandemResult};

use crate::change::Change;
use crate::clock::VectorClock;

#[derive(Debug, Default)]
pub struct ChangeLog {
    changes: Vec<Change>,
    positions: HashMap<ChangeId, usize>,
    clock: VectorClock,
    /// Changes no other logged change depends on
    heads: BTreeSet<ChangeId>,
    max_timestamp: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next change by `actor` must carry.
    pub fn next_seq(&self, actor: &ActorId) -> u64 {
        self.clock.get(actor) + 1
    }

    /// Dependencies of `change` not in the log.
    pub fn missing_deps(&self, change: &Change) -> Vec<ChangeId> {
        change
            .deps
            .iter()
            .filter(|d| !self.contains(d))
            .cloned()
            .collect()
    }

    /// Append a change whose dependencies are all present. Returns `false`
    /// for a duplicate.
    pub fn append(&mut self, change: Change) -> TandemResult<bool> {
        if self.contains(&change.id) {
            return Ok(false);
        }
        if let Some(dep) = self.missing_deps(&change).first() {
            return Err(TandemError::malformed(
                &change.id,
                format!("appended before dependency {dep}"),
            ));
        }
        let expected = self.next_seq(&change.id.actor);
        if change.id.seq != expected {
            return Err(TandemError::malformed(
                &change.id,
                format!("sequence gap: expected {expected}"),
            ));
        }

        self.clock.advance(&change.id.actor);
        for dep in &change.deps {
            self.heads.remove(dep);
        }
        self.heads.insert(change.id.clone());
        self.max_timestamp = self.max_timestamp.max(change.timestamp);
        self.positions.insert(change.id.clone(), self.changes.len());
        self.changes.push(change);
        Ok(true)
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &ChangeId) -> Option<&Change> {
        self.positions.get(id).map(|&i| &self.changes[i])
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn heads(&self) -> &BTreeSet<ChangeId> {
        &self.heads
    }

    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp
    }

    /// The requested changes in log (causal) order; unknown ids are skipped.
    pub fn select(&self, ids: &BTreeSet<ChangeId>) -> Vec<Change> {
        let mut positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.positions.get(id).copied())
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|i| self.changes[i].clone()).collect()
    }

    /// Changes not covered by `clock`, in log order.
    pub fn not_covered_by<'a>(&'a self, clock: &'a VectorClock) -> impl Iterator<Item = &'a Change> {
        self.changes.iter().filter(move |c| !clock.contains(&c.id))
    }
}

/// Sort changes loaded from storage into a causal order. Identical
/// duplicates collapse; a repeated id with different content, or a
/// dependency that never appears, means the log is corrupt.
pub fn causal_order(changes: Vec<Change>) -> TandemResult<Vec<Change>> {
    let mut by_id: HashMap<ChangeId, Change> = HashMap::with_capacity(changes.len());
    let mut arrival = Vec::with_capacity(changes.len());
    for change in changes {
        match by_id.get(&change.id) {
            Some(existing) if *existing == change => continue,
            Some(_) => {
                return Err(TandemError::CorruptLog(format!(
                    "change {} stored twice with different content",
                    change.id
                )))
            }
            None => {
                arrival.push(change.id.clone());
                by_id.insert(change.id.clone(), change);
            }
        }
    }

    let mut waiting_on: HashMap<ChangeId, usize> = HashMap::new();
    let mut dependents: HashMap<ChangeId, Vec<ChangeId>> = HashMap::new();
    for id in &arrival {
        let change = &by_id[id];
        for dep in &change.deps {
            if !by_id.contains_key(dep) {
                return Err(TandemError::CorruptLog(format!(
                    "change {id} depends on {dep}, which is not in the log"
                )));
            }
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        waiting_on.insert(id.clone(), change.deps.len());
    }

    let mut ready: VecDeque<ChangeId> = arrival
        .iter()
        .filter(|id| waiting_on[*id] == 0)
        .cloned()
        .collect();
    let mut ordered = Vec::with_capacity(arrival.len());
    while let Some(id) = ready.pop_front() {
        for next in dependents.remove(&id).unwrap_or_default() {
            if let Some(n) = waiting_on.get_mut(&next) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(next);
                }
            }
        }
        if let Some(change) = by_id.remove(&id) {
            ordered.push(change);
        }
    }

    if !by_id.is_empty() {
        return Err(TandemError::CorruptLog(format!(
            "{} changes form a dependency cycle",
            by_id.len()
        )));
    }
    Ok(ordered)
}
