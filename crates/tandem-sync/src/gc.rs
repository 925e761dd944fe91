//! Tombstone garbage collection.
//!
//! A tombstone may go once every live peer has acknowledged the change that
//! created it and this replica holds everything those peers advertised. A
//! live peer with unseen changes blocks collection outright, since one of
//! them may be concurrent with the tombstone. Peers silent for longer than
//! the expiry window stop counting; they are flagged for a full resync, and
//! for a bootstrap if collection passed what they had seen.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use tandem_core::{ActorId, EntityId};

use crate::clock::VectorClock;
use crate::document::Document;
use crate::peers::PeerRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Clock every live peer is known to hold
    pub stable: VectorClock,
    pub purged: usize,
    pub remaining: usize,
    /// Peers that just crossed the expiry window
    pub expired_peers: Vec<ActorId>,
    /// Live peers whose unseen changes held collection back
    pub blocked_by: Vec<ActorId>,
    /// Expired peers that must bootstrap before syncing again
    pub bootstrap_required: Vec<ActorId>,
}

pub fn collect_garbage(
    documents: &mut BTreeMap<EntityId, Document>,
    peers: &mut PeerRegistry,
    local: &VectorClock,
    now_ms: u64,
    expiry_ms: u64,
) -> GcReport {
    let stability = peers.stability(local, now_ms, expiry_ms);
    for peer in &stability.expired {
        info!(peer = %peer, "peer expired; it will need a full resync");
    }

    let mut report = GcReport {
        stable: stability.stable,
        expired_peers: stability.expired,
        blocked_by: stability.ahead,
        ..GcReport::default()
    };
    if !report.blocked_by.is_empty() {
        debug!(peers = ?report.blocked_by, "collection deferred until their changes arrive");
        report.remaining = documents.values().map(Document::tombstone_count).sum();
        return report;
    }

    for (entity, doc) in documents.iter_mut() {
        let n = doc.purge(&report.stable);
        if n > 0 {
            debug!(entity = %entity, purged = n, "tombstones collected");
        }
        report.purged += n;
        report.remaining += doc.tombstone_count();
    }

    if report.purged > 0 {
        report.bootstrap_required =
            peers.require_bootstrap(&stability.excluded, &report.stable, local);
        for peer in &report.bootstrap_required {
            warn!(peer = %peer, "collected tombstones the peer never saw; it must bootstrap");
        }
    }
    report
}
