//! JSON status API: replica stats, per-peer sync status, documents under
//! review, and forced resyncs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tandem_core::{ActorId, EntityId, TandemError};
use tandem_sync::{FieldConflict, ReplicaStats, SyncStatus};

use crate::metrics::HttpState;

pub fn routes() -> Router<HttpState> {
    Router::new()
        .route("/status", get(status))
        .route("/peers/{peer}", get(peer_status))
        .route("/peers/{peer}/resync", post(resync))
        .route("/documents/{entity}", get(document))
        .route("/conflicts", get(conflicts))
}

#[derive(Serialize)]
struct StatusBody {
    stats: ReplicaStats,
    root_hash: String,
    peers: Vec<SyncStatus>,
}

async fn status(State(state): State<HttpState>) -> Json<StatusBody> {
    let replica = &state.replica;
    Json(StatusBody {
        stats: replica.stats(),
        root_hash: replica.combined_root(),
        peers: replica.peers(),
    })
}

fn error_response(e: TandemError) -> Response {
    let code = match e {
        TandemError::UnknownPeer(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string()).into_response()
}

async fn peer_status(State(state): State<HttpState>, Path(peer): Path<String>) -> Response {
    match state.replica.get_sync_status(&ActorId::new(peer)) {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

async fn resync(State(state): State<HttpState>, Path(peer): Path<String>) -> Response {
    match state.replica.force_resync(&ActorId::new(peer)) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn document(State(state): State<HttpState>, Path(entity): Path<String>) -> Response {
    match state.replica.document(&EntityId::new(entity)) {
        Some(doc) => Json(doc).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn conflicts(State(state): State<HttpState>) -> Json<Vec<FieldConflict>> {
    Json(state.replica.conflicts())
}
