//! Daemon lifecycle: identity, replica, attachment store, sync manager,
//! HTTP endpoints, systemd notify and shutdown.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tandem_core::config::TandemConfig;
use tandem_storage::{build_operator, check_health, AttachmentStore};
use tandem_sync::{
    open_store, Replica, ReplicaIdentity, ReplicaOptions, SelectiveSync, SyncManager,
    TcpTransport,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::expand_tilde;

pub async fn run(config: TandemConfig) -> Result<()> {
    info!("daemon starting");

    // ── Replica identity ─────────────────────────────────────────────────
    let data_dir = expand_tilde(&config.replica.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let identity_path = config
        .replica
        .identity_file
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(|| data_dir.join("identity.json"));
    let device_name = config
        .replica
        .device_name
        .clone()
        .unwrap_or_else(default_device_name);
    let identity = ReplicaIdentity::load_or_create(&identity_path, &device_name)?;
    info!(actor = %identity.actor_id, device = %identity.name, "replica identity ready");

    // ── Change log and replica ───────────────────────────────────────────
    let store = open_store(&config.replica.store, &data_dir)
        .with_context(|| format!("opening {} change store", config.replica.store))?;
    let replica = Replica::open(identity, store, ReplicaOptions::from_config(&config))
        .context("loading replica state")?;
    let stats = replica.stats();
    info!(
        changes = stats.changes,
        documents = stats.documents,
        peers = stats.peers,
        "replica loaded"
    );

    // ── Attachments ──────────────────────────────────────────────────────
    let mut attachment_cfg = config.attachments.clone();
    attachment_cfg.root = attachment_cfg.root.as_deref().map(expand_tilde);
    let operator = build_operator(&attachment_cfg)?;
    if let Err(e) = check_health(&operator).await {
        warn!("attachment store: {e}");
    }
    let attachments = SelectiveSync::open(AttachmentStore::new(operator), &attachment_cfg)
        .await
        .context("opening attachment store")?;

    // ── Sync manager ─────────────────────────────────────────────────────
    let transport = TcpTransport::new(Duration::from_millis(config.sync.hello_timeout_ms));
    let manager = SyncManager::new(replica, attachments, transport, &config.sync);

    let listener = match &config.daemon.listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding sync listener {addr}"))?;
            info!(addr = %addr, "sync: listening");
            Some(listener)
        }
        None => None,
    };
    let tasks = manager.start(listener);
    info!(peers = config.sync.peers.len(), "sync manager started");

    // ── HTTP endpoints ───────────────────────────────────────────────────
    let http = config.daemon.metrics_addr.clone().map(|addr| {
        let state = crate::metrics::HttpState::new(&manager);
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("http server failed: {e}");
            }
        })
    });

    notify_ready();

    let cancel = manager.cancel_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("signal handler failed: {e}");
            }
            info!("shutdown requested");
        }
        _ = cancel.cancelled() => warn!("sync manager stopped"),
    }
    manager.shutdown();

    if let Some(http) = http {
        http.abort();
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {e}");
        }
    }
    info!("daemon stopped");
    Ok(())
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string(PathBuf::from("/etc/hostname"))
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown-device".into())
}

fn notify_ready() {
    // sd_notify(READY=1) when started by systemd; no-op otherwise
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
