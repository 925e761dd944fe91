//! Per-peer sync bookkeeping.
//!
//! One `PeerSyncState` per remote replica, created on first contact and kept
//! until the device is explicitly forgotten. `acked` is the clock the peer is
//! known to hold, learned only from what the peer itself reports: its
//! `Hello`, the changes it sends, and a catch-up whose roots matched. It
//! bounds tombstone collection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tandem_core::{ActorId, ChangeId};

use crate::clock::VectorClock;
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSyncState {
    pub peer: ActorId,
    /// Clock the peer is known to have reached
    #[serde(default)]
    pub acked: VectorClock,
    /// Unix ms of the last verified catch-up
    #[serde(default)]
    pub last_synced_at: Option<u64>,
    /// Unix ms of the last message from this peer
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub state: SessionState,
    /// Set when the peer was absent past the expiry window or asked to
    /// resync from scratch.
    #[serde(default)]
    pub needs_full_resync: bool,
    /// Tombstones were collected while the peer was expired and before it
    /// had seen them. Changes it made in the meantime could resurrect
    /// collected state, so it may only catch up if it holds nothing this
    /// replica lacks.
    #[serde(default)]
    pub bootstrap_required: bool,
    /// Our changes the peer refused, with its reason
    #[serde(default)]
    pub rejected: BTreeMap<ChangeId, String>,
}

impl PeerSyncState {
    pub fn new(peer: ActorId, now_ms: u64) -> Self {
        PeerSyncState {
            peer,
            acked: VectorClock::new(),
            last_synced_at: None,
            last_seen: now_ms,
            state: SessionState::Idle,
            needs_full_resync: false,
            bootstrap_required: false,
            rejected: BTreeMap::new(),
        }
    }
}

/// Snapshot returned by `get_sync_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub peer: ActorId,
    pub last_synced_at: Option<u64>,
    /// Local changes the peer is not known to hold
    pub pending_change_count: usize,
    pub state: SessionState,
    pub needs_full_resync: bool,
    pub bootstrap_required: bool,
}

/// Input to tombstone collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stability {
    /// Minimum acknowledged clock over live peers and the local clock
    pub stable: VectorClock,
    /// Peers that just crossed the expiry window
    pub expired: Vec<ActorId>,
    /// Every peer outside the window, newly expired or not
    pub excluded: Vec<ActorId>,
    /// Live peers that advertised changes this replica has not applied.
    /// Any of those may be concurrent with a tombstone, so nothing can be
    /// collected until they arrive.
    pub ahead: Vec<ActorId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRegistry {
    peers: BTreeMap<ActorId, PeerSyncState>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &ActorId) -> Option<&PeerSyncState> {
        self.peers.get(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSyncState> {
        self.peers.values()
    }

    /// Entry for `peer`, created on first contact.
    pub fn touch(&mut self, peer: &ActorId, now_ms: u64) -> &mut PeerSyncState {
        let state = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerSyncState::new(peer.clone(), now_ms));
        state.last_seen = state.last_seen.max(now_ms);
        state
    }

    /// Fold a clock the peer advertised or acknowledged.
    pub fn record_ack(&mut self, peer: &ActorId, clock: &VectorClock, now_ms: u64) {
        self.touch(peer, now_ms).acked.merge(clock);
    }

    pub fn set_state(&mut self, peer: &ActorId, state: SessionState, now_ms: u64) {
        self.touch(peer, now_ms).state = state;
    }

    /// Record a verified catch-up.
    pub fn mark_synced(&mut self, peer: &ActorId, now_ms: u64) {
        let state = self.touch(peer, now_ms);
        state.last_synced_at = Some(now_ms);
        state.needs_full_resync = false;
        state.bootstrap_required = false;
    }

    pub fn record_rejection(&mut self, peer: &ActorId, change: ChangeId, reason: String, now_ms: u64) {
        self.touch(peer, now_ms).rejected.insert(change, reason);
    }

    /// Drop what we believe the peer holds; the next session starts from
    /// scratch.
    pub fn reset(&mut self, peer: &ActorId, now_ms: u64) {
        let state = self.touch(peer, now_ms);
        state.acked = VectorClock::new();
        state.needs_full_resync = true;
    }

    /// "Forget device": the only way an entry is removed.
    pub fn forget(&mut self, peer: &ActorId) -> Option<PeerSyncState> {
        self.peers.remove(peer)
    }

    /// Minimum acknowledged clock across peers seen within `expiry_ms`,
    /// starting from `local`. Peers outside the window are flagged for a
    /// full resync; they no longer hold back collection.
    pub fn stability(&mut self, local: &VectorClock, now_ms: u64, expiry_ms: u64) -> Stability {
        let mut out = Stability {
            stable: local.clone(),
            ..Stability::default()
        };
        for state in self.peers.values_mut() {
            if now_ms.saturating_sub(state.last_seen) > expiry_ms {
                if !state.needs_full_resync {
                    state.needs_full_resync = true;
                    out.expired.push(state.peer.clone());
                }
                out.excluded.push(state.peer.clone());
                continue;
            }
            if !local.covers(&state.acked) {
                out.ahead.push(state.peer.clone());
            }
            out.stable = out.stable.meet(&state.acked);
        }
        out
    }

    /// After collecting below `stable`, flag excluded peers that had not
    /// seen everything collected, or that held changes this replica never
    /// applied. Returns the peers newly flagged.
    pub fn require_bootstrap(
        &mut self,
        excluded: &[ActorId],
        stable: &VectorClock,
        local: &VectorClock,
    ) -> Vec<ActorId> {
        let mut flagged = Vec::new();
        for peer in excluded {
            let Some(state) = self.peers.get_mut(peer) else {
                continue;
            };
            let missed = !state.acked.covers(stable) || !local.covers(&state.acked);
            if missed && !state.bootstrap_required {
                state.bootstrap_required = true;
                flagged.push(peer.clone());
            }
        }
        flagged
    }
}
