//! HTTP endpoint for the tool bridge
//!
//! `POST /api/bridge?sessionId=..&userId=..` with a JSON-RPC body.

use super::service::{BridgeReply, BridgeService};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use berth_foundation::{Result, BRIDGE_PATH};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Deserialize)]
struct BridgeQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// Build the axum router for the bridge endpoint
pub fn bridge_router(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route(BRIDGE_PATH, post(handle_bridge))
        .route("/health", get(health))
        .with_state(service)
}

async fn health() -> &'static str {
    "ok"
}

async fn handle_bridge(
    State(service): State<Arc<BridgeService>>,
    Query(query): Query<BridgeQuery>,
    body: Bytes,
) -> Response {
    match service
        .handle(query.session_id.as_deref(), query.user_id.as_deref(), &body)
        .await
    {
        BridgeReply::BadRequest(message) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        BridgeReply::Rpc(response) => (StatusCode::OK, Json(response)).into_response(),
    }
}

/// Serve the bridge until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, service: Arc<BridgeService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Tool bridge listening on {}{}", addr, BRIDGE_PATH);
    }
    axum::serve(listener, bridge_router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
