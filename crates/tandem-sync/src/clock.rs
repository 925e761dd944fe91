//! Causality tracking with per-actor vector clocks.
//!
//! A replica's clock maps every actor to the highest sequence number applied
//! from it. Changes from one actor are applied in sequence order (each one
//! depends on its predecessor), so the clock also describes exactly which
//! changes a replica holds.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use tandem_core::{ActorId, ChangeId};

/// Causal relationship between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalOrder {
    Before,
    After,
    Concurrent,
    Equal,
}

// ── Vector Clock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<ActorId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `actor` and return the new sequence number.
    pub fn advance(&mut self, actor: &ActorId) -> u64 {
        let entry = self.clocks.entry(actor.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Highest sequence number seen from `actor` (0 if none).
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.clocks.get(actor).copied().unwrap_or(0)
    }

    /// Record that `id` has been applied.
    pub fn observe(&mut self, id: &ChangeId) {
        let entry = self.clocks.entry(id.actor.clone()).or_insert(0);
        *entry = (*entry).max(id.seq);
    }

    /// Whether the change `id` is covered by this clock.
    pub fn contains(&self, id: &ChangeId) -> bool {
        id.seq <= self.get(&id.actor)
    }

    /// Pointwise max.
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, &seq) in &other.clocks {
            let entry = self.clocks.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(seq);
        }
    }

    /// Pointwise min; an actor absent from either side drops to 0.
    pub fn meet(&self, other: &VectorClock) -> VectorClock {
        let clocks = self
            .clocks
            .iter()
            .filter_map(|(actor, &seq)| {
                let m = seq.min(other.get(actor));
                (m > 0).then(|| (actor.clone(), m))
            })
            .collect();
        VectorClock { clocks }
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        compare(self, other)
    }

    /// Whether every change `other` covers is also covered here.
    pub fn covers(&self, other: &VectorClock) -> bool {
        other.clocks.iter().all(|(actor, &seq)| seq <= self.get(actor))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.clocks.iter().map(|(a, &s)| (a, s))
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|&s| s == 0)
    }

    /// Total number of changes the clock covers.
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }
}

/// Compare two clocks. `Concurrent` iff neither dominates the other
/// component-wise.
pub fn compare(a: &VectorClock, b: &VectorClock) -> CausalOrder {
    let mut has_greater = false;
    let mut has_less = false;

    for actor in a.clocks.keys().chain(b.clocks.keys()) {
        match a.get(actor).cmp(&b.get(actor)) {
            Ordering::Greater => has_greater = true,
            Ordering::Less => has_less = true,
            Ordering::Equal => {}
        }
        if has_greater && has_less {
            return CausalOrder::Concurrent;
        }
    }

    match (has_greater, has_less) {
        (true, false) => CausalOrder::After,
        (false, true) => CausalOrder::Before,
        _ => CausalOrder::Equal,
    }
}

// ── Wall clock ────────────────────────────────────────────────────────────────

/// Source of wall-clock milliseconds for hybrid timestamps.
pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock(AtomicU64::new(start_ms))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// Timestamp for a locally authored change: never below what the author
/// has already observed.
pub fn hybrid_timestamp(wall_ms: u64, max_seen: u64) -> u64 {
    wall_ms.max(max_seen.saturating_add(1))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::new(s)
    }

    #[test]
    fn test_hybrid_timestamp_never_goes_back() {
        assert_eq!(hybrid_timestamp(1_000, 10), 1_000);
        assert_eq!(hybrid_timestamp(1_000, 5_000), 5_001);

        let wall = ManualClock::new(50);
        wall.advance(25);
        assert_eq!(wall.now_ms(), 75);
        wall.set(10);
        assert_eq!(hybrid_timestamp(wall.now_ms(), 75), 76);
    }

    #[test]
    fn test_get_absent() {
        assert_eq!(VectorClock::new().get(&actor("nobody")), 0);
    }

    #[test]
    fn test_observe_and_contains() {
        let mut vc = VectorClock::new();
        vc.observe(&ChangeId::new(actor("a"), 3));
        assert!(vc.contains(&ChangeId::new(actor("a"), 2)));
        assert!(vc.contains(&ChangeId::new(actor("a"), 3)));
        assert!(!vc.contains(&ChangeId::new(actor("a"), 4)));
        assert!(!vc.contains(&ChangeId::new(actor("b"), 1)));
        // observing an older change never moves the clock back
        vc.observe(&ChangeId::new(actor("a"), 1));
        assert_eq!(vc.get(&actor("a")), 3);
    }

    #[test]
    fn test_compare_cases() {
        let empty = VectorClock::new();
        let mut x = VectorClock::new();
        x.advance(&actor("x"));
        let mut y = VectorClock::new();
        y.advance(&actor("y"));

        assert_eq!(compare(&empty, &VectorClock::new()), CausalOrder::Equal);
        assert_eq!(compare(&x, &empty), CausalOrder::After);
        assert_eq!(compare(&empty, &x), CausalOrder::Before);
        assert_eq!(compare(&x, &y), CausalOrder::Concurrent);
    }

    #[test]
    fn test_meet_drops_missing_actors() {
        let mut a = VectorClock::new();
        a.observe(&ChangeId::new(actor("a"), 5));
        a.observe(&ChangeId::new(actor("b"), 2));
        let mut b = VectorClock::new();
        b.observe(&ChangeId::new(actor("a"), 3));

        let m = a.meet(&b);
        assert_eq!(m.get(&actor("a")), 3);
        assert_eq!(m.get(&actor("b")), 0);
        assert_eq!(m.total(), 3);
    }

    #[test]
    fn test_json_shape() {
        let mut vc = VectorClock::new();
        vc.observe(&ChangeId::new(actor("laptop"), 2));
        assert_eq!(serde_json::to_string(&vc).unwrap(), r#"{"laptop":2}"#);
    }
}
