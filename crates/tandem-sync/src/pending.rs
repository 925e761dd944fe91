//! Bounded holding area for changes that arrived before their dependencies.

use std::collections::{BTreeMap, BTreeSet};

use tandem_core::{ActorId, ChangeId};

use crate::change::Change;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestDecision {
    Buffered,
    Duplicate,
    /// The buffer is full; the change was not kept and the caller should
    /// fall back to a full resync with the peer.
    Overflow,
}

/// A buffered change and the peer that supplied it, so it is relayed
/// correctly once released.
#[derive(Debug, Clone)]
struct Held {
    change: Change,
    origin: Option<ActorId>,
}

#[derive(Debug, Clone)]
pub struct PendingBuffer {
    buffered: BTreeMap<ChangeId, Held>,
    max_changes: usize,
}

impl PendingBuffer {
    pub fn new(max_changes: usize) -> Self {
        Self {
            buffered: BTreeMap::new(),
            max_changes: max_changes.max(1),
        }
    }

    pub fn insert(&mut self, change: Change, origin: Option<ActorId>) -> IngestDecision {
        if self.buffered.contains_key(&change.id) {
            return IngestDecision::Duplicate;
        }
        if self.buffered.len() >= self.max_changes {
            return IngestDecision::Overflow;
        }
        self.buffered.insert(change.id.clone(), Held { change, origin });
        IngestDecision::Buffered
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.buffered.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_changes
    }

    /// Remove and return every buffered change that becomes applicable given
    /// `known`, with its origin, in an order where dependencies come first.
    pub fn drain_ready(
        &mut self,
        known: impl Fn(&ChangeId) -> bool,
    ) -> Vec<(Change, Option<ActorId>)> {
        let mut released: BTreeSet<ChangeId> = BTreeSet::new();
        let mut ready = Vec::new();
        loop {
            let batch: Vec<ChangeId> = self
                .buffered
                .values()
                .map(|h| &h.change)
                .filter(|c| c.deps.iter().all(|d| known(d) || released.contains(d)))
                .map(|c| c.id.clone())
                .collect();
            if batch.is_empty() {
                break;
            }
            for id in batch {
                if let Some(held) = self.buffered.remove(&id) {
                    released.insert(id);
                    ready.push((held.change, held.origin));
                }
            }
        }
        ready
    }

    /// Dependencies that are neither `known` nor buffered themselves: what
    /// to ask a peer for.
    pub fn missing(&self, known: impl Fn(&ChangeId) -> bool) -> BTreeSet<ChangeId> {
        self.buffered
            .values()
            .flat_map(|h| h.change.deps.iter())
            .filter(|d| !known(d) && !self.buffered.contains_key(*d))
            .cloned()
            .collect()
    }
}
