//! Per-node views.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use shoal_core::PeerId;
use shoal_services::{NeighborStatus, NodeStatus};

use super::ApiState;

pub async fn handle_node(
    State(state): State<ApiState>,
    Path(id): Path<PeerId>,
) -> Result<Json<NodeStatus>, (StatusCode, String)> {
    Ok(Json(state.node(id)?.status()))
}

pub async fn handle_neighbors(
    State(state): State<ApiState>,
    Path(id): Path<PeerId>,
) -> Result<Json<NeighborStatus>, (StatusCode, String)> {
    Ok(Json(state.node(id)?.neighbor_status()))
}
