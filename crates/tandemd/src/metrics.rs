//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (200 if the change log index verifies
//!                 and the attachment store is reachable)
//!
//! The JSON status API from `api` is mounted on the same listener.

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::collector::Collector;
use prometheus_client::metrics::counter::ConstCounter;
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::registry::Registry;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tandem_sync::transport::Transport;
use tandem_sync::{Replica, SelectiveSync, SyncCounters, SyncManager};

/// Shared state behind every HTTP handler.
#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<Registry>,
    pub replica: Replica,
    pub attachments: SelectiveSync,
}

impl HttpState {
    pub fn new<T: Transport>(manager: &SyncManager<T>) -> Self {
        let mut registry = Registry::with_prefix("tandem");
        registry.register_collector(Box::new(SyncCollector {
            replica: manager.replica().clone(),
            counters: manager.counters(),
        }));
        HttpState {
            registry: Arc::new(registry),
            replica: manager.replica().clone(),
            attachments: manager.attachments().clone(),
        }
    }
}

/// Reads session counters and replica stats at scrape time.
struct SyncCollector {
    replica: Replica,
    counters: Arc<SyncCounters>,
}

impl fmt::Debug for SyncCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCollector")
            .field("actor", self.replica.actor())
            .finish()
    }
}

fn counter(encoder: &mut DescriptorEncoder, name: &str, help: &str, value: u64) -> fmt::Result {
    let metric = ConstCounter::new(value);
    metric.encode(encoder.encode_descriptor(name, help, None, metric.metric_type())?)
}

fn gauge(encoder: &mut DescriptorEncoder, name: &str, help: &str, value: usize) -> fmt::Result {
    let metric = ConstGauge::new(i64::try_from(value).unwrap_or(i64::MAX));
    metric.encode(encoder.encode_descriptor(name, help, None, metric.metric_type())?)
}

impl Collector for SyncCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> fmt::Result {
        let c = &self.counters;
        let load = |v: &std::sync::atomic::AtomicU64| v.load(Ordering::Relaxed);
        counter(&mut encoder, "sessions_started", "Peer sessions started", load(&c.sessions_started))?;
        counter(&mut encoder, "sessions_failed", "Peer sessions that ended in error", load(&c.sessions_failed))?;
        counter(&mut encoder, "changes_received", "Remote changes applied", load(&c.changes_received))?;
        counter(&mut encoder, "changes_sent", "Changes sent to peers", load(&c.changes_sent))?;
        counter(&mut encoder, "changes_rejected", "Remote changes refused as malformed", load(&c.changes_rejected))?;
        counter(&mut encoder, "checksum_failures", "Catch-up rounds whose roots disagreed", load(&c.checksum_failures))?;
        counter(&mut encoder, "resyncs", "Full resyncs started", load(&c.resyncs))?;

        let stats = self.replica.stats();
        gauge(&mut encoder, "changes", "Changes in the local log", stats.changes)?;
        gauge(&mut encoder, "pending_changes", "Remote changes waiting on dependencies", stats.pending)?;
        gauge(&mut encoder, "documents", "Materialized documents", stats.documents)?;
        gauge(&mut encoder, "conflicts", "Fields awaiting manual review", stats.conflicts)?;
        gauge(&mut encoder, "tombstones", "Tombstones not yet collected", stats.tombstones)?;
        gauge(&mut encoder, "peers", "Known peers", stats.peers)?;
        gauge(&mut encoder, "live_sessions", "Sessions currently connected", stats.live_sessions)?;
        Ok(())
    }
}

/// Serve metrics, probes and the status API on `addr` (e.g. "127.0.0.1:9464")
pub async fn serve(addr: String, state: HttpState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("http bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "http: listening on /metrics, /healthz, /readyz, /status");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("http server: {e}"))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .merge(crate::api::routes())
        .with_state(state)
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 503 when the index no longer matches the log or the
/// attachment store is unreachable.
async fn readyz_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.replica.verify_index() {
        Ok(true) => {}
        Ok(false) => return (StatusCode::SERVICE_UNAVAILABLE, "index out of date"),
        Err(e) => {
            tracing::warn!("index verification failed: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "index verification failed");
        }
    }
    match tandem_storage::check_health(state.attachments.store().operator()).await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "attachment store unreachable"),
    }
}
