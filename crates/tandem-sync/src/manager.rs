//! Session supervision: dial configured peers with backoff, accept inbound
//! sessions, and run periodic maintenance.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tandem_core::config::SyncConfig;
use tandem_core::TandemResult;

use crate::attachments::SelectiveSync;
use crate::replica::Replica;
use crate::session::{run_session, SessionConfig, SessionOutcome, SyncCounters};
use crate::transport::{Listener, Transport};

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Backoff {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_initial_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        )
    }

    /// Next delay: half the current step plus up to half again at random.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = (self.current * 2).min(self.max);
        let half = step.as_millis() as u64 / 2;
        let jitter = rand::thread_rng().gen_range(0..=half);
        Duration::from_millis(half + jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct ManagerInner<T> {
    replica: Replica,
    attachments: SelectiveSync,
    transport: T,
    session: SessionConfig,
    sync: SyncConfig,
    counters: Arc<SyncCounters>,
    cancel: CancellationToken,
}

pub struct SyncManager<T> {
    inner: Arc<ManagerInner<T>>,
}

impl<T> Clone for SyncManager<T> {
    fn clone(&self) -> Self {
        SyncManager {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> SyncManager<T> {
    pub fn new(replica: Replica, attachments: SelectiveSync, transport: T, cfg: &SyncConfig) -> Self {
        SyncManager {
            inner: Arc::new(ManagerInner {
                replica,
                attachments,
                transport,
                session: SessionConfig::from_config(cfg),
                sync: cfg.clone(),
                counters: Arc::new(SyncCounters::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.inner.replica
    }

    pub fn attachments(&self) -> &SelectiveSync {
        &self.inner.attachments
    }

    pub fn counters(&self) -> Arc<SyncCounters> {
        Arc::clone(&self.inner.counters)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Stop every loop and session; sessions say goodbye first.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Dial every configured peer, serve `listener` if given, and run
    /// maintenance.
    pub fn start<L: Listener>(&self, listener: Option<L>) -> Vec<JoinHandle<()>> {
        let mut tasks: Vec<JoinHandle<()>> = self
            .inner
            .sync
            .peers
            .iter()
            .map(|addr| self.spawn_dialer(addr.clone()))
            .collect();
        if let Some(listener) = listener {
            tasks.push(self.spawn_listener(listener));
        }
        tasks.push(self.spawn_maintenance());
        tasks
    }

    async fn session<S>(&self, stream: S) -> TandemResult<SessionOutcome>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        run_session(
            self.inner.replica.clone(),
            self.inner.attachments.clone(),
            stream,
            self.inner.session.clone(),
            Arc::clone(&self.inner.counters),
            self.inner.cancel.child_token(),
        )
        .await
    }

    /// Keep a session with `addr` alive until shutdown, reconnecting with
    /// backoff after every failure.
    pub fn spawn_dialer(&self, addr: String) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = this.inner.cancel.clone();
            let mut backoff = Backoff::from_config(&this.inner.sync);
            loop {
                let connected = tokio::select! {
                    _ = cancel.cancelled() => break,
                    connected = this.inner.transport.connect(&addr) => connected,
                };
                match connected {
                    Ok(stream) => match this.session(stream).await {
                        Ok(outcome) => {
                            backoff.reset();
                            debug!(addr = %addr, peer = ?outcome.peer, "session ended");
                        }
                        Err(e) if !e.is_recoverable() => {
                            error!(addr = %addr, "unrecoverable sync error, stopping: {e}");
                            cancel.cancel();
                            break;
                        }
                        Err(e) => debug!(addr = %addr, "session failed: {e}"),
                    },
                    Err(e) => debug!(addr = %addr, "connect failed: {e}"),
                }

                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(addr = %addr, "dialer stopped");
        })
    }

    /// Accept inbound streams and run a session on each.
    pub fn spawn_listener<L: Listener>(&self, mut listener: L) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = this.inner.cancel.clone();
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "inbound connection");
                        let session = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session.session(stream).await {
                                debug!(remote = %remote, "inbound session failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!("listener stopped");
        })
    }

    /// Tombstone collection and checkpoints every `gc_interval_secs`, plus a
    /// final checkpoint on shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = this.inner.cancel.clone();
            let period = Duration::from_secs(this.inner.sync.gc_interval_secs.max(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => this.maintain(true).await,
                }
            }
            this.maintain(false).await;
        })
    }

    async fn maintain(&self, collect: bool) {
        let replica = self.inner.replica.clone();
        let result = tokio::task::spawn_blocking(move || -> TandemResult<()> {
            if collect {
                let report = replica.collect_garbage(replica.now_ms())?;
                for peer in &report.expired_peers {
                    replica.force_resync(peer)?;
                }
            }
            replica.checkpoint()
        })
        .await;
        match result {
            Ok(Ok(())) => debug!(collect, "maintenance done"),
            Ok(Err(e)) => warn!("maintenance failed: {e}"),
            Err(e) => warn!("maintenance task panicked: {e}"),
        }
        if !collect {
            info!("final checkpoint written");
        }
    }
}
