use crate::*;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dashmap::DashMap;
use tower::ServiceExt;

// ══════════════════════════════════════════════════════════════════════════════
//  Status API over a live swarm
// ══════════════════════════════════════════════════════════════════════════════

fn state(swarm: &Swarm) -> shoal_api::ApiState {
    let nodes = Arc::new(DashMap::new());
    for node in swarm.nodes() {
        nodes.insert(node.id(), node.clone());
    }
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    shoal_api::ApiState {
        nodes,
        stats: swarm.stats.clone(),
        shutdown_tx,
    }
}

async fn get_json(state: shoal_api::ApiState, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = shoal_api::router(state)
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
}

#[tokio::test(start_paused = true)]
async fn status_reports_every_node() {
    let mut swarm = Swarm::new(ShoalConfig::default());
    swarm.join(1, (0.0, 0.0), 2_000_000).await;
    swarm.join(2, (10.0, 0.0), 3_000_000).await;
    tune(swarm.node(2), LOW).await;

    let (status, json) = get_json(state(&swarm), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    let nodes = json["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["id"], 1);
    assert_eq!(nodes[1]["upload_bps"], 3_000_000);
    assert_eq!(nodes[1]["video_bitrate"], 400_000);
    assert_eq!(json["playing"], 1);
    assert_eq!(json["from_server"], 1);
    swarm.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn neighbors_endpoint_lists_close_peers() {
    let mut swarm = Swarm::new(ShoalConfig::default());
    swarm.join(1, (0.0, 0.0), 1_000_000).await;
    swarm.join(2, (10.0, 0.0), 1_000_000).await;
    assert!(wait_for(60, || !swarm.node(1).close_peers().is_empty()).await);

    let (status, json) = get_json(state(&swarm), "/api/nodes/1/neighbors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], 1);
    assert_eq!(json["close_peers"][0]["id"], 2);

    let (status, json) = get_json(state(&swarm), "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["from_peer"], 0);
    swarm.shutdown().await;
}
