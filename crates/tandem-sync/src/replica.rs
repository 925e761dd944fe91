//! The replica: one actor's change log, documents and sync bookkeeping.
//!
//! All state lives behind a single mutex. Every operation holds it only for
//! in-memory work plus one local append, never across network I/O, so local
//! mutations complete without waiting on any peer. Applying changes to
//! documents is therefore single-writer.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use tandem_chunks::hash_to_hex;
use tandem_core::config::TandemConfig;
use tandem_core::{ActorId, ChangeId, EntityId, TandemError, TandemResult};

use crate::change::{Change, Mutation};
use crate::clock::{hybrid_timestamp, SystemClock, VectorClock, WallClock};
use crate::document::Document;
use crate::gc::{self, GcReport};
use crate::identity::ReplicaIdentity;
use crate::index::{Descent, DivergenceIndex, IndexNode, NodeId};
use crate::log::{causal_order, ChangeLog};
use crate::peers::{PeerRegistry, SyncStatus};
use crate::pending::{IngestDecision, PendingBuffer};
use crate::policy::{FieldConflict, PolicyTable};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::session::{PeerLink, SessionState};
use crate::store::{ChangeStore, MemoryStore, Snapshot};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub index_depth: u8,
    pub max_pending_changes: usize,
    pub peer_expiry_ms: u64,
    pub policy: PolicyTable,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self::from_config(&TandemConfig::default())
    }
}

impl ReplicaOptions {
    pub fn from_config(cfg: &TandemConfig) -> Self {
        ReplicaOptions {
            index_depth: cfg.index.depth,
            max_pending_changes: cfg.sync.max_pending_changes,
            peer_expiry_ms: cfg.sync.peer_expiry_secs.saturating_mul(1000),
            policy: PolicyTable::new(cfg.fields.clone()),
        }
    }
}

/// Result of offering a remote change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change and any buffered changes it unblocked, in apply order.
    Applied(Vec<ChangeId>),
    Duplicate,
    /// Held until these dependencies arrive.
    Buffered { missing: BTreeSet<ChangeId> },
}

/// A change that just entered the log, as seen by `watch()`.
#[derive(Debug, Clone)]
pub struct AppendedChange {
    pub change: Change,
    /// Peer that supplied it; `None` for local changes.
    pub origin: Option<ActorId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStats {
    pub actor: ActorId,
    pub changes: usize,
    pub pending: usize,
    pub documents: usize,
    pub conflicts: usize,
    pub tombstones: usize,
    pub peers: usize,
    pub live_sessions: usize,
}

pub type Callback = Arc<dyn Fn(&EntityId, Option<&Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Inner {
    log: ChangeLog,
    pending: PendingBuffer,
    documents: BTreeMap<EntityId, Document>,
    index: DivergenceIndex,
    peers: PeerRegistry,
    store: Box<dyn ChangeStore>,
}

impl Inner {
    /// Durably append, then index and merge. Dependencies must be present.
    fn commit(&mut self, change: &Change) -> TandemResult<()> {
        self.store.append(change)?;
        self.log.append(change.clone())?;
        self.index.insert(change)?;
        self.documents
            .entry(change.entity.clone())
            .or_insert_with(|| Document::new(change.entity.clone()))
            .apply(change);
        Ok(())
    }

    fn knows(&self, id: &ChangeId) -> bool {
        self.log.contains(id) || self.pending.contains(id)
    }
}

struct Shared {
    identity: ReplicaIdentity,
    options: ReplicaOptions,
    wall: Arc<dyn WallClock>,
    inner: Mutex<Inner>,
    subscribers: Mutex<BTreeMap<EntityId, Vec<(SubscriptionId, Callback)>>>,
    next_subscription: AtomicU64,
    appended: broadcast::Sender<AppendedChange>,
    links: Mutex<HashMap<ActorId, PeerLink>>,
}

#[derive(Clone)]
pub struct Replica {
    shared: Arc<Shared>,
}

impl Replica {
    /// Open a replica over `store`, replaying its change log.
    pub fn open(
        identity: ReplicaIdentity,
        store: Box<dyn ChangeStore>,
        options: ReplicaOptions,
    ) -> TandemResult<Self> {
        Self::open_with_clock(identity, store, options, Arc::new(SystemClock))
    }

    /// In-memory replica with no durable state.
    pub fn in_memory(identity: ReplicaIdentity, options: ReplicaOptions) -> TandemResult<Self> {
        Self::open(identity, Box::new(MemoryStore::new()), options)
    }

    pub fn open_with_clock(
        identity: ReplicaIdentity,
        store: Box<dyn ChangeStore>,
        options: ReplicaOptions,
        wall: Arc<dyn WallClock>,
    ) -> TandemResult<Self> {
        let inner = load(&identity, store, &options).inspect_err(|e| {
            if !e.is_recoverable() {
                error!(actor = %identity.actor_id, "change log unusable, bootstrap a fresh replica: {e}");
            }
        })?;
        info!(
            actor = %identity.actor_id,
            changes = inner.log.len(),
            documents = inner.documents.len(),
            peers = inner.peers.len(),
            "replica opened"
        );

        let (appended, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Replica {
            shared: Arc::new(Shared {
                identity,
                options,
                wall,
                inner: Mutex::new(inner),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
                appended,
                links: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn actor(&self) -> &ActorId {
        &self.shared.identity.actor_id
    }

    pub fn identity(&self) -> &ReplicaIdentity {
        &self.shared.identity
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.shared.options.policy
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.wall.now_ms()
    }

    // ── Local changes ─────────────────────────────────────────────────────

    /// Author a change on this replica's behalf and apply it immediately.
    pub fn emit_local_change(
        &self,
        entity: &EntityId,
        mutation: Mutation,
    ) -> TandemResult<ChangeId> {
        let actor = self.actor().clone();
        let now = self.now_ms();

        let (change, notify) = {
            let mut inner = self.shared.inner.lock();
            let id = ChangeId::new(actor.clone(), inner.log.next_seq(&actor));
            let op = match inner.documents.get(entity) {
                Some(doc) => doc.prepare(&id, mutation)?,
                None => Document::new(entity.clone()).prepare(&id, mutation)?,
            };
            let mut deps = inner.log.heads().clone();
            deps.extend(id.predecessor());
            let change = Change {
                id,
                deps,
                entity: entity.clone(),
                op,
                timestamp: hybrid_timestamp(now, inner.log.max_timestamp()),
            };
            change.validate(self.policy())?;
            inner.commit(&change)?;
            let _ = self.shared.appended.send(AppendedChange {
                change: change.clone(),
                origin: None,
            });
            let notify = self.collect_notifications(&inner, [entity]);
            (change, notify)
        };

        debug!(change = %change.id, entity = %entity, op = change.op.name(), "local change");
        self.notify(notify);
        Ok(change.id)
    }

    /// Pick a value for a field under manual review. The write supersedes
    /// every concurrent value.
    pub fn resolve_conflict(
        &self,
        entity: &EntityId,
        field: &str,
        value: Value,
    ) -> TandemResult<ChangeId> {
        self.emit_local_change(entity, Mutation::set(field, value))
    }

    // ── Remote changes ────────────────────────────────────────────────────

    /// Offer a change received from `origin`. Malformed changes are refused
    /// with `MalformedChange` and never reach the log. A full pending buffer
    /// drops the change with `PendingOverflow`; the sender should then be
    /// resynced from scratch.
    pub fn apply_remote(
        &self,
        change: Change,
        origin: Option<&ActorId>,
    ) -> TandemResult<ApplyOutcome> {
        let (outcome, notify) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.knows(&change.id) {
                return Ok(ApplyOutcome::Duplicate);
            }
            if let Err(e) = change.validate(self.policy()) {
                warn!(change = %change.id, peer = ?origin, "rejecting malformed change: {e}");
                return Err(e);
            }

            if !inner.log.missing_deps(&change).is_empty() {
                let outcome = match inner.pending.insert(change, origin.cloned()) {
                    IngestDecision::Buffered => ApplyOutcome::Buffered {
                        missing: inner.pending.missing(|d| inner.log.contains(d)),
                    },
                    IngestDecision::Duplicate => ApplyOutcome::Duplicate,
                    IngestDecision::Overflow => {
                        let capacity = inner.pending.capacity();
                        warn!(peer = ?origin, capacity, "pending buffer full");
                        return Err(TandemError::PendingOverflow(capacity));
                    }
                };
                return Ok(outcome);
            }

            let mut ready = vec![(change, origin.cloned())];
            let mut applied = Vec::new();
            let mut touched = BTreeSet::new();
            while !ready.is_empty() {
                for (change, from) in ready {
                    inner.commit(&change)?;
                    trace_applied(&change, from.as_ref());
                    touched.insert(change.entity.clone());
                    applied.push(change.id.clone());
                    let _ = self.shared.appended.send(AppendedChange { change, origin: from });
                }
                ready = inner.pending.drain_ready(|d| inner.log.contains(d));
            }
            let notify = self.collect_notifications(inner, touched.iter());
            (ApplyOutcome::Applied(applied), notify)
        };
        self.notify(notify);
        Ok(outcome)
    }

    /// Whether `id` is in the log or waiting in the pending buffer.
    pub fn knows(&self, id: &ChangeId) -> bool {
        self.shared.inner.lock().knows(id)
    }

    /// Dependencies buffered changes are still waiting for.
    pub fn missing_dependencies(&self) -> BTreeSet<ChangeId> {
        let inner = self.shared.inner.lock();
        inner.pending.missing(|d| inner.log.contains(d))
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Merged view of an entity; `None` if unknown or deleted.
    pub fn document(&self, entity: &EntityId) -> Option<Value> {
        let inner = self.shared.inner.lock();
        inner
            .documents
            .get(entity)
            .and_then(|d| d.materialize(self.policy()))
    }

    /// Full merge state of an entity, tombstoned or not.
    pub fn document_state(&self, entity: &EntityId) -> Option<Document> {
        self.shared.inner.lock().documents.get(entity).cloned()
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.shared.inner.lock().documents.keys().cloned().collect()
    }

    pub fn clock(&self) -> VectorClock {
        self.shared.inner.lock().log.clock().clone()
    }

    pub fn change_count(&self) -> usize {
        self.shared.inner.lock().log.len()
    }

    pub fn conflicts(&self) -> Vec<FieldConflict> {
        let inner = self.shared.inner.lock();
        inner
            .documents
            .values()
            .flat_map(|d| d.conflicts(self.policy()))
            .collect()
    }

    // ── Divergence index ──────────────────────────────────────────────────

    pub fn index_depth(&self) -> u8 {
        self.shared.inner.lock().index.depth()
    }

    pub fn root_hashes(&self) -> BTreeMap<EntityId, String> {
        self.shared.inner.lock().index.root_hashes()
    }

    /// Hex of the combined root over every entity.
    pub fn combined_root(&self) -> String {
        hash_to_hex(&self.shared.inner.lock().index.combined_root())
    }

    /// Rebuild the index from the log and check it against the incremental
    /// one. A mismatch is repaired by keeping the rebuilt index.
    pub fn verify_index(&self) -> TandemResult<bool> {
        let mut inner = self.shared.inner.lock();
        let rebuilt = DivergenceIndex::build(inner.index.depth(), inner.log.iter())?;
        if rebuilt.combined_root() == inner.index.combined_root() {
            return Ok(true);
        }
        warn!(actor = %self.actor(), "divergence index disagreed with the log, rebuilt");
        inner.index = rebuilt;
        Ok(false)
    }

    /// The `Hello` this replica opens a session with.
    pub fn hello(&self) -> Message {
        let inner = self.shared.inner.lock();
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            actor_id: self.actor().clone(),
            root_hashes: inner.index.root_hashes(),
            clock: inner.log.clock().clone(),
            index_depth: inner.index.depth(),
        }
    }

    pub fn answer_index_query(&self, entity: &EntityId, nodes: &[NodeId]) -> Vec<IndexNode> {
        self.shared.inner.lock().index.answer(entity, nodes)
    }

    pub fn begin_descent(
        &self,
        remote_roots: &BTreeMap<EntityId, String>,
    ) -> TandemResult<(Descent, Vec<(EntityId, Vec<NodeId>)>)> {
        Descent::start(&self.shared.inner.lock().index, remote_roots)
    }

    pub fn continue_descent(
        &self,
        descent: &mut Descent,
        entity: &EntityId,
        nodes: &[IndexNode],
    ) -> TandemResult<Option<Vec<NodeId>>> {
        descent.on_nodes(&self.shared.inner.lock().index, entity, nodes)
    }

    /// The requested changes this replica holds, in dependency order.
    pub fn changes_for(&self, ids: &BTreeSet<ChangeId>) -> Vec<Change> {
        self.shared.inner.lock().log.select(ids)
    }

    /// Subscribe to every change entering the log from now on.
    pub fn watch(&self) -> broadcast::Receiver<AppendedChange> {
        self.shared.appended.subscribe()
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Call `callback` with the merged state of `entity` (or `None` once
    /// deleted) whenever a local or remote change touches it.
    pub fn subscribe<F>(&self, entity: &EntityId, callback: F) -> SubscriptionId
    where
        F: Fn(&EntityId, Option<&Value>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared
            .subscribers
            .lock()
            .entry(entity.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut subs = self.shared.subscribers.lock();
        let mut found = false;
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|(id, _)| *id != subscription);
            found |= list.len() != before;
        }
        subs.retain(|_, list| !list.is_empty());
        found
    }

    fn collect_notifications<'a>(
        &self,
        inner: &Inner,
        entities: impl IntoIterator<Item = &'a EntityId>,
    ) -> Vec<(EntityId, Option<Value>, Vec<Callback>)> {
        let subs = self.shared.subscribers.lock();
        entities
            .into_iter()
            .filter_map(|entity| {
                let callbacks: Vec<Callback> = subs
                    .get(entity)?
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                let view = inner
                    .documents
                    .get(entity)
                    .and_then(|d| d.materialize(self.policy()));
                Some((entity.clone(), view, callbacks))
            })
            .collect()
    }

    fn notify(&self, notifications: Vec<(EntityId, Option<Value>, Vec<Callback>)>) {
        for (entity, view, callbacks) in notifications {
            for cb in callbacks {
                cb(&entity, view.as_ref());
            }
        }
    }

    // ── Peers ─────────────────────────────────────────────────────────────

    /// Apply `f` to the peer registry and persist it.
    fn update_peers<R>(&self, f: impl FnOnce(&mut PeerRegistry, u64) -> R) -> TandemResult<R> {
        let now = self.now_ms();
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        let result = f(&mut inner.peers, now);
        inner.store.save_peers(&inner.peers)?;
        Ok(result)
    }

    /// Record a peer's `Hello`: first contact creates its state.
    pub fn record_peer_hello(&self, peer: &ActorId, clock: &VectorClock) -> TandemResult<()> {
        self.update_peers(|peers, now| {
            peers.record_ack(peer, clock, now);
            peers.set_state(peer, SessionState::CapabilityExchange, now);
        })
    }

    /// The peer sent us these changes, so it holds them and their causal
    /// past. Kept in memory until the next persisted peer update.
    pub fn note_peer_has<'a>(&self, peer: &ActorId, ids: impl IntoIterator<Item = &'a ChangeId>) {
        let now = self.now_ms();
        let mut clock = VectorClock::new();
        for id in ids {
            clock.observe(id);
        }
        self.shared.inner.lock().peers.record_ack(peer, &clock, now);
    }

    /// Refuse catch-up with a peer that must bootstrap while it still holds
    /// changes this replica never applied: they may be concurrent with
    /// tombstones collected in its absence.
    pub fn admit_peer(&self, peer: &ActorId, clock: &VectorClock) -> TandemResult<()> {
        let inner = self.shared.inner.lock();
        let Some(state) = inner.peers.get(peer) else {
            return Ok(());
        };
        if state.bootstrap_required && !inner.log.clock().covers(clock) {
            warn!(peer = %peer, "peer holds changes from before tombstone collection, refusing catch-up");
            return Err(TandemError::BootstrapRequired(peer.to_string()));
        }
        if state.needs_full_resync {
            info!(peer = %peer, "peer returned after expiry or reset, catching up from scratch");
        }
        Ok(())
    }

    pub fn set_peer_state(&self, peer: &ActorId, state: SessionState) -> TandemResult<()> {
        self.update_peers(|peers, now| peers.set_state(peer, state, now))
    }

    /// Catch-up verified: the peer holds everything in `clock`.
    pub fn mark_synced(&self, peer: &ActorId, clock: &VectorClock) -> TandemResult<()> {
        self.update_peers(|peers, now| {
            peers.record_ack(peer, clock, now);
            peers.mark_synced(peer, now);
        })
    }

    pub fn record_rejection(&self, peer: &ActorId, change: ChangeId, reason: String) -> TandemResult<()> {
        warn!(peer = %peer, change = %change, "peer rejected change: {reason}");
        self.update_peers(|peers, now| peers.record_rejection(peer, change, reason, now))
    }

    pub fn get_sync_status(&self, peer: &ActorId) -> TandemResult<SyncStatus> {
        let inner = self.shared.inner.lock();
        let state = inner
            .peers
            .get(peer)
            .ok_or_else(|| TandemError::UnknownPeer(peer.to_string()))?;
        Ok(SyncStatus {
            peer: peer.clone(),
            last_synced_at: state.last_synced_at,
            pending_change_count: inner.log.not_covered_by(&state.acked).count(),
            state: state.state,
            needs_full_resync: state.needs_full_resync,
            bootstrap_required: state.bootstrap_required,
        })
    }

    pub fn peers(&self) -> Vec<SyncStatus> {
        let ids: Vec<ActorId> = {
            let inner = self.shared.inner.lock();
            inner.peers.iter().map(|p| p.peer.clone()).collect()
        };
        ids.iter()
            .filter_map(|p| self.get_sync_status(p).ok())
            .collect()
    }

    /// Forget what the peer is believed to hold and, if a session with it
    /// is live, restart that session from capability exchange.
    pub fn force_resync(&self, peer: &ActorId) -> TandemResult<()> {
        let known = self.shared.inner.lock().peers.get(peer).is_some();
        if !known {
            return Err(TandemError::UnknownPeer(peer.to_string()));
        }
        self.update_peers(|peers, now| peers.reset(peer, now))?;
        info!(peer = %peer, "full resync requested");
        match self.link(peer) {
            Some(link) => link.force_resync(),
            None => Ok(()),
        }
    }

    /// Drop a device's sync state for good.
    pub fn forget_peer(&self, peer: &ActorId) -> TandemResult<bool> {
        self.update_peers(|peers, _| peers.forget(peer).is_some())
    }

    pub(crate) fn register_link(&self, link: PeerLink) {
        self.shared.links.lock().insert(link.peer().clone(), link);
    }

    /// Remove `link` unless a newer session with the same peer replaced it.
    pub(crate) fn unregister_link(&self, link: &PeerLink) {
        let mut links = self.shared.links.lock();
        if links.get(link.peer()).is_some_and(|l| l.same_session(link)) {
            links.remove(link.peer());
        }
    }

    /// Live session with `peer`, if any.
    pub fn link(&self, peer: &ActorId) -> Option<PeerLink> {
        self.shared.links.lock().get(peer).cloned()
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Persist materialized documents so the next open replays only newer
    /// changes.
    pub fn checkpoint(&self) -> TandemResult<()> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        let snapshot = Snapshot {
            clock: inner.log.clock().clone(),
            documents: inner.documents.values().cloned().collect(),
        };
        inner.store.save_snapshot(&snapshot)?;
        debug!(actor = %self.actor(), changes = inner.log.len(), "checkpoint written");
        Ok(())
    }

    /// Purge tombstones every live peer has acknowledged, unless a live peer
    /// advertised changes this replica has not applied yet.
    pub fn collect_garbage(&self, now_ms: u64) -> TandemResult<GcReport> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        let local = inner.log.clock().clone();
        let report = gc::collect_garbage(
            &mut inner.documents,
            &mut inner.peers,
            &local,
            now_ms,
            self.shared.options.peer_expiry_ms,
        );
        inner.store.save_peers(&inner.peers)?;
        if report.purged > 0 {
            info!(purged = report.purged, remaining = report.remaining, "tombstone collection");
        }
        Ok(report)
    }

    pub fn stats(&self) -> ReplicaStats {
        let live_sessions = self.shared.links.lock().len();
        let inner = self.shared.inner.lock();
        ReplicaStats {
            actor: self.actor().clone(),
            changes: inner.log.len(),
            pending: inner.pending.len(),
            documents: inner.documents.len(),
            conflicts: inner
                .documents
                .values()
                .map(|d| d.conflicts(self.policy()).len())
                .sum(),
            tombstones: inner.documents.values().map(Document::tombstone_count).sum(),
            peers: inner.peers.len(),
            live_sessions,
        }
    }
}

fn trace_applied(change: &Change, origin: Option<&ActorId>) {
    debug!(
        change = %change.id,
        entity = %change.entity,
        peer = ?origin,
        op = change.op.name(),
        "remote change applied"
    );
}

/// Replay the durable log (and snapshot) into memory.
fn load(
    identity: &ReplicaIdentity,
    store: Box<dyn ChangeStore>,
    options: &ReplicaOptions,
) -> TandemResult<Inner> {
    let changes = causal_order(store.load_changes()?)?;

    let mut log = ChangeLog::new();
    let mut index = DivergenceIndex::new(options.index_depth);
    for change in changes {
        index.insert(&change)?;
        log.append(change)
            .map_err(|e| TandemError::CorruptLog(e.to_string()))?;
    }

    let mut documents: BTreeMap<EntityId, Document> = BTreeMap::new();
    let snapshot = store.load_snapshot()?.filter(|s| {
        let usable = s.clock.iter().all(|(actor, seq)| seq <= log.clock().get(actor));
        if !usable {
            warn!(actor = %identity.actor_id, "snapshot is ahead of the change log, ignoring it");
        }
        usable
    });
    let covered = match snapshot {
        Some(s) => {
            documents.extend(s.documents.into_iter().map(|d| (d.entity().clone(), d)));
            s.clock
        }
        None => VectorClock::new(),
    };
    let mut replayed = 0usize;
    for change in log.not_covered_by(&covered) {
        documents
            .entry(change.entity.clone())
            .or_insert_with(|| Document::new(change.entity.clone()))
            .apply(change);
        replayed += 1;
    }
    debug!(actor = %identity.actor_id, replayed, "documents rebuilt");

    let peers = store.load_peers()?;
    Ok(Inner {
        log,
        pending: PendingBuffer::new(options.max_pending_changes),
        documents,
        index,
        peers,
        store,
    })
}
