//! HTTP API handlers: read-only views of the running nodes as JSON.

pub mod nodes;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;
use dashmap::DashMap;

use shoal_core::PeerId;
use shoal_services::{FetchStats, OverlayNode};

#[derive(Clone)]
pub struct ApiState {
    pub nodes: Arc<DashMap<PeerId, Arc<OverlayNode>>>,
    /// Fetch counters shared by every node of this process.
    pub stats: Arc<FetchStats>,
    /// Shutdown broadcast sender. Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl ApiState {
    fn node(&self, id: PeerId) -> Result<Arc<OverlayNode>, (StatusCode, String)> {
        self.nodes
            .get(&id)
            .map(|n| n.value().clone())
            .ok_or((StatusCode::NOT_FOUND, format!("node {id} not found")))
    }
}

pub use nodes::{handle_neighbors, handle_node};
pub use status::{handle_shutdown, handle_stats, handle_status};
