//! One sync session with one peer over one byte stream.
//!
//! Phases:
//!   capability_exchange  both sides send `Hello`; versions and index depth
//!                        must agree
//!   catch_up             each side walks the other's divergence index,
//!                        requests the changes it lacks and sends `Verify`
//!                        once they are applied; equal roots end the phase
//!   update               new changes stream as `UpdateChange` frames
//!
//! A root mismatch restarts from `Hello`, up to `max_checksum_failures`
//! times in a row. A `Hello` arriving after the handshake means the peer
//! restarted, so this side restarts too. Attachment requests and replies
//! are answered in every phase.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tandem_core::config::SyncConfig;
use tandem_core::{ActorId, ChangeId, EntityId, SyncTier, TandemError, TandemResult};
use tandem_storage::AttachmentManifest;

use crate::attachments::{ChunkReply, ChunkSource, SelectiveSync};
use crate::change::{AttachmentRef, Change, Operation};
use crate::clock::VectorClock;
use crate::index::{Descent, IndexNode, NodeId};
use crate::protocol::{FrameCodec, Message, PROTOCOL_VERSION};
use crate::replica::{AppendedChange, ApplyOutcome, Replica};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    CapabilityExchange,
    CatchUp,
    Update,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::CapabilityExchange => "capability_exchange",
            SessionState::CatchUp => "catch_up",
            SessionState::Update => "update",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hello_timeout: Duration,
    pub catchup_timeout: Duration,
    /// Round trip allowed for one attachment request
    pub chunk_timeout: Duration,
    pub max_batch_changes: usize,
    pub max_checksum_failures: u32,
    pub compress_threshold: usize,
}

impl SessionConfig {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        SessionConfig {
            hello_timeout: Duration::from_millis(cfg.hello_timeout_ms),
            catchup_timeout: Duration::from_millis(cfg.catchup_timeout_ms),
            chunk_timeout: Duration::from_millis(cfg.chunk_timeout_ms),
            max_batch_changes: cfg.max_batch_changes.max(1),
            max_checksum_failures: cfg.max_checksum_failures.max(1),
            compress_threshold: cfg.compress_threshold_bytes,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Process-wide sync counters, exported as metrics by the daemon.
#[derive(Debug, Default)]
pub struct SyncCounters {
    pub sessions_started: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub changes_received: AtomicU64,
    pub changes_sent: AtomicU64,
    pub changes_rejected: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub resyncs: AtomicU64,
}

impl SyncCounters {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub enum SessionCommand {
    /// Restart from capability exchange.
    ForceResync,
    Send(Message),
    Close,
}

// ── Peer link ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ReplyKey {
    Manifest(String),
    Chunk(String, u32),
}

impl ReplyKey {
    fn content_hash(&self) -> &str {
        match self {
            ReplyKey::Manifest(h) | ReplyKey::Chunk(h, _) => h,
        }
    }
}

/// Handle to a live session, registered with the replica while the session
/// runs. Attachment requests made through it are answered by the peer.
#[derive(Debug, Clone)]
pub struct PeerLink {
    peer: ActorId,
    commands: mpsc::Sender<SessionCommand>,
    replies: Arc<Mutex<HashMap<ReplyKey, oneshot::Sender<Message>>>>,
    reply_timeout: Duration,
}

impl PeerLink {
    fn new(peer: ActorId, commands: mpsc::Sender<SessionCommand>, reply_timeout: Duration) -> Self {
        PeerLink {
            peer,
            commands,
            replies: Arc::new(Mutex::new(HashMap::new())),
            reply_timeout,
        }
    }

    pub fn peer(&self) -> &ActorId {
        &self.peer
    }

    pub fn force_resync(&self) -> TandemResult<()> {
        self.commands
            .try_send(SessionCommand::ForceResync)
            .map_err(|e| TandemError::Transport(format!("session with {}: {e}", self.peer)))
    }

    pub async fn send(&self, message: Message) -> TandemResult<()> {
        self.commands
            .send(SessionCommand::Send(message))
            .await
            .map_err(|_| self.closed())
    }

    /// Ask the session to say goodbye and stop.
    pub async fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }

    pub(crate) fn same_session(&self, other: &PeerLink) -> bool {
        Arc::ptr_eq(&self.replies, &other.replies)
    }

    fn closed(&self) -> TandemError {
        TandemError::Transport(format!("session with {} closed", self.peer))
    }

    /// Hand an attachment reply to whoever is waiting for it.
    fn deliver(&self, message: Message) {
        let mut replies = self.replies.lock();
        let keys: Vec<ReplyKey> = match &message {
            Message::AttachmentManifest { content_hash, .. } => {
                vec![ReplyKey::Manifest(content_hash.clone())]
            }
            Message::AttachmentChunk {
                content_hash,
                chunk_index,
                ..
            } => vec![ReplyKey::Chunk(content_hash.clone(), *chunk_index)],
            Message::AttachmentUnavailable { content_hash } => replies
                .keys()
                .filter(|k| k.content_hash() == content_hash)
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        let mut delivered = false;
        for key in keys {
            if let Some(waiter) = replies.remove(&key) {
                delivered |= waiter.send(message.clone()).is_ok();
            }
        }
        if !delivered {
            debug!(peer = %self.peer, kind = message.kind(), "unsolicited attachment reply");
        }
    }

    /// Fail every outstanding request.
    fn shutdown(&self) {
        self.replies.lock().clear();
    }

    async fn exchange(&self, key: ReplyKey, request: Message) -> TandemResult<Message> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().insert(key.clone(), tx);
        if self.send(request).await.is_err() {
            self.replies.lock().remove(&key);
            return Err(self.closed());
        }
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => {
                self.replies.lock().remove(&key);
                Err(TandemError::Timeout("attachment transfer"))
            }
        }
    }
}

impl ChunkSource for PeerLink {
    async fn manifest(&self, content_hash: &str) -> TandemResult<AttachmentManifest> {
        let request = Message::AttachmentManifestRequest {
            content_hash: content_hash.to_string(),
        };
        match self
            .exchange(ReplyKey::Manifest(content_hash.to_string()), request)
            .await?
        {
            Message::AttachmentManifest {
                content_hash,
                size,
                chunks,
            } => Ok(AttachmentManifest {
                content_hash,
                size,
                chunks,
            }),
            _ => Err(TandemError::AttachmentNotFound(content_hash.to_string())),
        }
    }

    async fn chunk(&self, content_hash: &str, chunk_index: u32) -> TandemResult<ChunkReply> {
        let request = Message::AttachmentChunkRequest {
            content_hash: content_hash.to_string(),
            chunk_index,
        };
        match self
            .exchange(ReplyKey::Chunk(content_hash.to_string(), chunk_index), request)
            .await?
        {
            Message::AttachmentChunk {
                bytes, chunk_hash, ..
            } => Ok(ChunkReply { bytes, chunk_hash }),
            _ => Err(TandemError::AttachmentNotFound(content_hash.to_string())),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub peer: Option<ActorId>,
    pub state: SessionState,
    pub changes_received: u64,
    pub changes_sent: u64,
}

/// Per-round catch-up progress; reset by every `Hello` we send.
#[derive(Debug, Default)]
struct Round {
    peer_roots: BTreeMap<EntityId, String>,
    /// `None` once the walk of the peer's index is complete
    descent: Option<Descent>,
    awaiting_batches: usize,
    /// Root and clock we sent in `Verify`
    ours: Option<(String, VectorClock)>,
    theirs: Option<String>,
}

enum Flow {
    Continue,
    Close,
}

pub struct Session<T> {
    replica: Replica,
    attachments: SelectiveSync,
    config: SessionConfig,
    framed: Framed<T, FrameCodec>,
    commands: mpsc::Receiver<SessionCommand>,
    command_tx: mpsc::Sender<SessionCommand>,
    appended: broadcast::Receiver<AppendedChange>,
    counters: Arc<SyncCounters>,
    cancel: CancellationToken,
    state: SessionState,
    peer: Option<ActorId>,
    link: Option<PeerLink>,
    round: Round,
    checksum_failures: u32,
    deadline: Option<Instant>,
    received: u64,
    sent: u64,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        replica: Replica,
        attachments: SelectiveSync,
        io: T,
        config: SessionConfig,
        counters: Arc<SyncCounters>,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, commands) = mpsc::channel(64);
        let appended = replica.watch();
        Session {
            framed: Framed::new(io, FrameCodec::new(config.compress_threshold)),
            replica,
            attachments,
            config,
            commands,
            command_tx,
            appended,
            counters,
            cancel,
            state: SessionState::Idle,
            peer: None,
            link: None,
            round: Round::default(),
            checksum_failures: 0,
            deadline: None,
            received: 0,
            sent: 0,
        }
    }

    /// Drive the session until either side closes it, it is cancelled, or
    /// it fails.
    pub async fn run(mut self) -> TandemResult<SessionOutcome> {
        SyncCounters::bump(&self.counters.sessions_started, 1);
        let result = self.drive().await;
        let final_state = match &result {
            Ok(()) => SessionState::Closed,
            Err(_) => SessionState::Failed,
        };
        self.state = final_state;

        if let Some(link) = self.link.take() {
            link.shutdown();
            self.replica.unregister_link(&link);
        }
        if let Some(peer) = &self.peer {
            if let Err(e) = self.replica.set_peer_state(peer, final_state) {
                warn!(peer = %peer, "recording session end: {e}");
            }
        }

        match result {
            Ok(()) => {
                info!(peer = ?self.peer, received = self.received, sent = self.sent, "session closed");
                Ok(SessionOutcome {
                    peer: self.peer,
                    state: final_state,
                    changes_received: self.received,
                    changes_sent: self.sent,
                })
            }
            Err(e) => {
                SyncCounters::bump(&self.counters.sessions_failed, 1);
                warn!(peer = ?self.peer, "session failed: {e}");
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> TandemResult<()> {
        self.start_round().await?;
        loop {
            let deadline = self.deadline;
            let streaming = self.state == SessionState::Update;
            let flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = self.framed.send(Message::Goodbye).await;
                    Flow::Close
                }
                _ = sleep_until(deadline) => {
                    return Err(TandemError::Timeout(self.state.as_str()));
                }
                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => self.on_message(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(TandemError::Transport("peer closed the connection".into()))
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await?,
                    None => Flow::Close,
                },
                appended = self.appended.recv(), if streaming => {
                    self.on_appended(appended).await?;
                    Flow::Continue
                }
            };
            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    async fn send(&mut self, message: Message) -> TandemResult<()> {
        self.framed.send(message).await
    }

    fn set_state(&mut self, state: SessionState) -> TandemResult<()> {
        debug!(peer = ?self.peer, from = self.state.as_str(), to = state.as_str(), "session state");
        self.state = state;
        self.deadline = match state {
            SessionState::CapabilityExchange => Some(Instant::now() + self.config.hello_timeout),
            SessionState::CatchUp => Some(Instant::now() + self.config.catchup_timeout),
            _ => None,
        };
        match &self.peer {
            Some(peer) => self.replica.set_peer_state(peer, state),
            None => Ok(()),
        }
    }

    /// Send `Hello` and wait for the peer's.
    async fn start_round(&mut self) -> TandemResult<()> {
        self.round = Round::default();
        self.set_state(SessionState::CapabilityExchange)?;
        let hello = self.replica.hello();
        self.send(hello).await
    }

    fn peer(&self) -> TandemResult<ActorId> {
        self.peer
            .clone()
            .ok_or_else(|| TandemError::Codec("peer has not said hello".into()))
    }

    async fn on_message(&mut self, message: Message) -> TandemResult<Flow> {
        if self.peer.is_none() && !matches!(message, Message::Hello { .. } | Message::Goodbye) {
            return Err(TandemError::Codec(format!(
                "expected hello, got {}",
                message.kind()
            )));
        }
        if message.is_attachment_reply() {
            if let Some(link) = &self.link {
                link.deliver(message);
            }
            return Ok(Flow::Continue);
        }

        match message {
            Message::Hello {
                protocol_version,
                actor_id,
                root_hashes,
                clock,
                index_depth,
            } => {
                self.on_hello(protocol_version, actor_id, root_hashes, clock, index_depth)
                    .await?
            }
            Message::Goodbye => {
                debug!(peer = ?self.peer, "peer said goodbye");
                return Ok(Flow::Close);
            }
            Message::IndexQuery { entity, nodes } => {
                let nodes = self.replica.answer_index_query(&entity, &nodes);
                self.send(Message::IndexNodes { entity, nodes }).await?;
            }
            Message::IndexNodes { entity, nodes } => self.on_index_nodes(entity, nodes).await?,
            Message::DeltaRequest { missing_change_ids } => {
                self.send_delta(missing_change_ids).await?
            }
            Message::DeltaBatch { changes, is_final } => {
                self.ingest(changes).await?;
                if is_final && self.state == SessionState::CatchUp {
                    self.round.awaiting_batches = self.round.awaiting_batches.saturating_sub(1);
                    self.progress().await?;
                }
            }
            Message::Verify { root_hash } => {
                if self.state == SessionState::CatchUp {
                    self.round.theirs = Some(root_hash);
                    self.progress().await?;
                }
            }
            Message::UpdateChange { change } => self.ingest(vec![change]).await?,
            Message::Reject { change_id, reason } => {
                SyncCounters::bump(&self.counters.changes_rejected, 1);
                let peer = self.peer()?;
                self.replica.record_rejection(&peer, change_id, reason)?;
            }
            request @ (Message::AttachmentManifestRequest { .. }
            | Message::AttachmentChunkRequest { .. }) => {
                if let Some(reply) = self.attachments.serve(&request).await? {
                    self.send(reply).await?;
                }
            }
            other => debug!(kind = other.kind(), "ignoring message"),
        }
        Ok(Flow::Continue)
    }

    async fn on_hello(
        &mut self,
        version: u32,
        actor: ActorId,
        roots: BTreeMap<EntityId, String>,
        clock: VectorClock,
        depth: u8,
    ) -> TandemResult<()> {
        if version != PROTOCOL_VERSION {
            let _ = self.send(Message::Goodbye).await;
            return Err(TandemError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }
        if depth != self.replica.index_depth() {
            let _ = self.send(Message::Goodbye).await;
            return Err(TandemError::Codec(format!(
                "index depth mismatch: local {}, remote {depth}",
                self.replica.index_depth()
            )));
        }
        if &actor == self.replica.actor() {
            return Err(TandemError::Codec("peer announced our own actor id".into()));
        }

        match &self.peer {
            Some(known) if *known != actor => {
                return Err(TandemError::Codec(format!(
                    "peer {known} re-announced itself as {actor}"
                )));
            }
            Some(_) => {}
            None => {
                let link = PeerLink::new(actor.clone(), self.command_tx.clone(), self.config.chunk_timeout);
                self.replica.register_link(link.clone());
                self.link = Some(link);
                self.peer = Some(actor.clone());
                info!(peer = %actor, entities = roots.len(), "session established");
            }
        }
        self.replica.record_peer_hello(&actor, &clock)?;
        if let Err(e) = self.replica.admit_peer(&actor, &clock) {
            let _ = self.send(Message::Goodbye).await;
            return Err(e);
        }

        if self.state != SessionState::CapabilityExchange {
            debug!(peer = %actor, "peer restarted the session");
            self.start_round().await?;
        }
        self.round.peer_roots = roots;
        self.enter_catch_up().await
    }

    async fn enter_catch_up(&mut self) -> TandemResult<()> {
        self.set_state(SessionState::CatchUp)?;
        let (descent, queries) = self.replica.begin_descent(&self.round.peer_roots)?;
        self.round.descent = Some(descent);
        for (entity, nodes) in queries {
            self.send(Message::IndexQuery { entity, nodes }).await?;
        }
        self.progress().await
    }

    async fn on_index_nodes(&mut self, entity: EntityId, nodes: Vec<IndexNode>) -> TandemResult<()> {
        if self.state != SessionState::CatchUp {
            debug!(entity = %entity, "late index nodes ignored");
            return Ok(());
        }
        let Some(descent) = self.round.descent.as_mut() else {
            return Ok(());
        };
        let next: Option<Vec<NodeId>> = self.replica.continue_descent(descent, &entity, &nodes)?;
        if let Some(nodes) = next {
            self.send(Message::IndexQuery { entity, nodes }).await?;
        }
        self.progress().await
    }

    /// Advance catch-up: request what the finished walk found missing, send
    /// `Verify` once everything arrived, and compare roots.
    async fn progress(&mut self) -> TandemResult<()> {
        if self.state != SessionState::CatchUp {
            return Ok(());
        }
        if self.round.descent.as_ref().is_some_and(Descent::is_done) {
            if let Some(descent) = self.round.descent.take() {
                let missing: Vec<ChangeId> = descent
                    .finish()
                    .missing_local
                    .into_iter()
                    .filter(|id| !self.replica.knows(id))
                    .collect();
                debug!(peer = ?self.peer, missing = missing.len(), "divergence located");
                if !missing.is_empty() {
                    self.request(missing).await?;
                }
            }
        }

        if self.round.descent.is_none() && self.round.awaiting_batches == 0 && self.round.ours.is_none() {
            let root = self.replica.combined_root();
            self.round.ours = Some((root.clone(), self.replica.clock()));
            self.send(Message::Verify { root_hash: root }).await?;
        }

        let (local, clock, remote) = match (&self.round.ours, &self.round.theirs) {
            (Some((ours, clock)), Some(theirs)) => (ours.clone(), clock.clone(), theirs.clone()),
            _ => return Ok(()),
        };
        let peer = self.peer()?;
        if local == remote {
            self.replica.mark_synced(&peer, &clock)?;
            self.checksum_failures = 0;
            self.set_state(SessionState::Update)?;
            info!(peer = %peer, root = %local, "caught up");
            return Ok(());
        }

        self.checksum_failures += 1;
        SyncCounters::bump(&self.counters.checksum_failures, 1);
        warn!(
            peer = %peer,
            local = %local,
            remote = %remote,
            attempt = self.checksum_failures,
            "root mismatch after catch-up"
        );
        if self.checksum_failures >= self.config.max_checksum_failures {
            return Err(TandemError::ChecksumMismatch { local, remote });
        }
        self.start_round().await
    }

    async fn request(&mut self, missing: Vec<ChangeId>) -> TandemResult<()> {
        if self.state == SessionState::CatchUp {
            self.round.awaiting_batches += 1;
        }
        self.send(Message::DeltaRequest {
            missing_change_ids: missing,
        })
        .await
    }

    /// Answer a `DeltaRequest` in dependency order, `max_batch_changes` per
    /// frame. The last frame is always marked final, even when empty.
    async fn send_delta(&mut self, ids: Vec<ChangeId>) -> TandemResult<()> {
        let wanted: BTreeSet<ChangeId> = ids.into_iter().collect();
        let changes = self.replica.changes_for(&wanted);
        if changes.len() < wanted.len() {
            debug!(
                peer = ?self.peer,
                requested = wanted.len(),
                held = changes.len(),
                "peer asked for changes we do not hold"
            );
        }
        let total = changes.len() as u64;
        let mut changes = changes.into_iter().peekable();
        loop {
            let batch: Vec<Change> = changes.by_ref().take(self.config.max_batch_changes).collect();
            let is_final = changes.peek().is_none();
            self.send(Message::DeltaBatch {
                changes: batch,
                is_final,
            })
            .await?;
            if is_final {
                break;
            }
        }
        self.sent += total;
        SyncCounters::bump(&self.counters.changes_sent, total);
        Ok(())
    }

    /// Apply changes from the peer. Malformed ones are rejected back to it;
    /// missing dependencies are requested.
    async fn ingest(&mut self, changes: Vec<Change>) -> TandemResult<()> {
        let peer = self.peer()?;
        let mut missing = BTreeSet::new();
        let mut applied = BTreeSet::new();
        for change in changes {
            let id = change.id.clone();
            let seen: Vec<ChangeId> = change.deps.iter().cloned().chain([id.clone()]).collect();
            match self.replica.apply_remote(change, Some(&peer)) {
                Ok(ApplyOutcome::Applied(ids)) => {
                    self.replica.note_peer_has(&peer, &seen);
                    applied.extend(ids);
                }
                Ok(ApplyOutcome::Duplicate) => self.replica.note_peer_has(&peer, &seen),
                Ok(ApplyOutcome::Buffered { missing: deps }) => {
                    self.replica.note_peer_has(&peer, &seen);
                    missing.extend(deps);
                }
                Err(TandemError::PendingOverflow(capacity)) => {
                    SyncCounters::bump(&self.counters.resyncs, 1);
                    warn!(peer = %peer, capacity, "too many changes waiting on dependencies, resyncing");
                    self.replica.force_resync(&peer)?;
                    return Ok(());
                }
                Err(e @ TandemError::MalformedChange { .. }) => {
                    SyncCounters::bump(&self.counters.changes_rejected, 1);
                    self.send(Message::Reject {
                        change_id: id,
                        reason: e.to_string(),
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }

        if !applied.is_empty() {
            self.received += applied.len() as u64;
            SyncCounters::bump(&self.counters.changes_received, applied.len() as u64);
            for change in self.replica.changes_for(&applied) {
                if let Operation::Attach { attachment, .. } = change.op {
                    self.on_attachment(attachment).await?;
                }
            }
        }
        if !missing.is_empty() {
            debug!(peer = %peer, missing = missing.len(), "requesting missing dependencies");
            self.request(missing.into_iter().collect()).await?;
        }
        Ok(())
    }

    /// New attachment metadata: record it and start fetching the payload if
    /// its tier says so.
    async fn on_attachment(&mut self, attachment: AttachmentRef) -> TandemResult<()> {
        let tier = self.attachments.register(&attachment).await?;
        if tier != SyncTier::Always || self.attachments.is_local(&attachment.content_hash).await? {
            return Ok(());
        }
        let Some(link) = self.link.clone() else {
            return Ok(());
        };
        let attachments = self.attachments.clone();
        tokio::spawn(async move {
            let hash = attachment.content_hash;
            match attachments.fetch(&hash, &link).await {
                Ok(bytes) => info!(peer = %link.peer(), hash = %hash, size = bytes.len(), "attachment fetched"),
                Err(e) => warn!(peer = %link.peer(), hash = %hash, "attachment fetch failed: {e}"),
            }
        });
        Ok(())
    }

    async fn on_command(&mut self, command: SessionCommand) -> TandemResult<Flow> {
        match command {
            SessionCommand::ForceResync => {
                if self.peer.is_some() && self.state != SessionState::CapabilityExchange {
                    SyncCounters::bump(&self.counters.resyncs, 1);
                    info!(peer = ?self.peer, "restarting session for a full resync");
                    self.start_round().await?;
                }
            }
            SessionCommand::Send(message) => self.send(message).await?,
            SessionCommand::Close => {
                self.send(Message::Goodbye).await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Forward a change that just entered the log, unless it came from this
    /// peer.
    async fn on_appended(&mut self, appended: Result<AppendedChange, RecvError>) -> TandemResult<()> {
        match appended {
            Ok(AppendedChange { change, origin }) => {
                let peer = self.peer()?;
                if origin.as_ref() == Some(&peer) {
                    return Ok(());
                }
                self.send(Message::UpdateChange { change }).await?;
                self.sent += 1;
                SyncCounters::bump(&self.counters.changes_sent, 1);
                Ok(())
            }
            Err(RecvError::Lagged(skipped)) => {
                SyncCounters::bump(&self.counters.resyncs, 1);
                warn!(peer = ?self.peer, skipped, "fell behind the local change stream, resyncing");
                self.start_round().await
            }
            Err(RecvError::Closed) => Ok(()),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run one session to completion.
pub async fn run_session<T>(
    replica: Replica,
    attachments: SelectiveSync,
    io: T,
    config: SessionConfig,
    counters: Arc<SyncCounters>,
    cancel: CancellationToken,
) -> TandemResult<SessionOutcome>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    Session::new(replica, attachments, io, config, counters, cancel)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Mutation;
    use crate::identity::ReplicaIdentity;
    use crate::replica::ReplicaOptions;
    use tandem_core::config::AttachmentConfig;
    use tandem_storage::AttachmentStore;

    async fn node(actor: &str) -> (Replica, SelectiveSync) {
        let replica =
            Replica::in_memory(ReplicaIdentity::with_actor(actor), ReplicaOptions::default()).unwrap();
        let store = AttachmentStore::in_memory().unwrap();
        let attachments = SelectiveSync::open(store, &AttachmentConfig::default())
            .await
            .unwrap();
        (replica, attachments)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn two_replicas_catch_up_then_stream() {
        let (a, a_att) = node("a").await;
        let (b, b_att) = node("b").await;
        let entity = EntityId::new("doc");
        a.emit_local_change(&entity, Mutation::set("title", "from a")).unwrap();
        b.emit_local_change(&entity, Mutation::add("tags", "from b")).unwrap();

        let (left, right) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let counters = Arc::new(SyncCounters::default());
        let sa = tokio::spawn(run_session(a.clone(), a_att, left, SessionConfig::default(), counters.clone(), cancel.clone()));
        let sb = tokio::spawn(run_session(b.clone(), b_att, right, SessionConfig::default(), counters.clone(), cancel.clone()));

        wait_for(|| {
            a.get_sync_status(&ActorId::new("b"))
                .map(|s| s.state == SessionState::Update)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(a.combined_root(), b.combined_root());

        a.emit_local_change(&entity, Mutation::set("title", "live")).unwrap();
        wait_for(|| b.document(&entity).is_some_and(|d| d["title"] == "live")).await;
        assert!(a.link(&ActorId::new("b")).is_some());

        cancel.cancel();
        let outcome = sa.await.unwrap().unwrap();
        assert_eq!(outcome.peer, Some(ActorId::new("b")));
        let _ = sb.await.unwrap();
        assert!(a.link(&ActorId::new("b")).is_none());
        assert!(counters.changes_received.load(Ordering::Relaxed) >= 3);
    }

    #[tokio::test]
    async fn version_mismatch_fails_the_session() {
        let (a, a_att) = node("a").await;
        let (left, right) = tokio::io::duplex(4096);
        let mut peer = Framed::new(right, FrameCodec::default());
        let task = tokio::spawn(run_session(
            a,
            a_att,
            left,
            SessionConfig::default(),
            Arc::new(SyncCounters::default()),
            CancellationToken::new(),
        ));

        let hello = peer.next().await.unwrap().unwrap();
        assert_eq!(hello.kind(), "hello");
        peer.send(Message::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            actor_id: ActorId::new("z"),
            root_hashes: BTreeMap::new(),
            clock: VectorClock::new(),
            index_depth: 4,
        })
        .await
        .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TandemError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn malformed_update_is_rejected_back() {
        let (a, a_att) = node("a").await;
        let (b, _) = node("b").await;
        let id = b.emit_local_change(&EntityId::new("doc"), Mutation::set("k", 1)).unwrap();
        let mut bad = b.changes_for(&BTreeSet::from([id])).pop().unwrap();
        bad.deps.clear();
        bad.id.seq = 2;

        let (left, right) = tokio::io::duplex(64 * 1024);
        let mut peer = Framed::new(right, FrameCodec::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            a.clone(),
            a_att,
            left,
            SessionConfig::default(),
            Arc::new(SyncCounters::default()),
            cancel.clone(),
        ));

        let _ = peer.next().await.unwrap().unwrap();
        peer.send(b.hello()).await.unwrap();
        peer.send(Message::UpdateChange { change: bad }).await.unwrap();
        loop {
            match peer.next().await.unwrap().unwrap() {
                Message::Reject { change_id, reason } => {
                    assert_eq!(change_id.seq, 2);
                    assert!(reason.contains("predecessor"));
                    break;
                }
                Message::IndexQuery { entity, nodes } => {
                    let nodes = b.answer_index_query(&entity, &nodes);
                    peer.send(Message::IndexNodes { entity, nodes }).await.unwrap();
                }
                _ => {}
            }
        }
        assert_eq!(a.change_count(), 0);
        cancel.cancel();
        let _ = task.await;
    }
}
