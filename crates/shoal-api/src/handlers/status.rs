//! /status, /stats and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use shoal_services::{FetchSnapshot, NodeStatus};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub nodes: Vec<NodeStatus>,
    pub playing: usize,
    pub from_peer: u64,
    pub from_server: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let mut nodes: Vec<NodeStatus> = state.nodes.iter().map(|n| n.value().status()).collect();
    nodes.sort_by_key(|n| n.id);

    let snapshot = state.stats.snapshot();
    Json(StatusResponse {
        playing: nodes.iter().filter(|n| n.playing).count(),
        from_peer: snapshot.from_peer,
        from_server: snapshot.total_from_server(),
        nodes,
    })
}

// ── /stats ───────────────────────────────────────────────────────────────────

pub async fn handle_stats(State(state): State<ApiState>) -> Json<FetchSnapshot> {
    Json(state.stats.snapshot())
}

// ── /daemon/shutdown ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub shutting_down: bool,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        shutting_down: true,
    })
}
