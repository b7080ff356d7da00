pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/stats", get(handlers::handle_stats))
        .route("/nodes/{id}", get(handlers::handle_node))
        .route("/nodes/{id}/neighbors", get(handlers::handle_neighbors))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn empty_state() -> ApiState {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        ApiState {
            nodes: Arc::new(dashmap::DashMap::new()),
            stats: Arc::new(shoal_services::FetchStats::new()),
            shutdown_tx,
        }
    }

    async fn get(state: ApiState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn status_lists_no_nodes_when_empty() {
        let (status, json) = get(empty_state(), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["nodes"], serde_json::json!([]));
        assert_eq!(json["from_peer"], 0);
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let (status, _) = get(empty_state(), "/api/nodes/42/neighbors").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_is_broadcast() {
        let state = empty_state();
        let mut rx = state.shutdown_tx.subscribe();
        let response = router(state)
            .oneshot(
                Request::post("/api/daemon/shutdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_ok());
    }
}
