//! Health check endpoint

use crate::supervisor::{ListenerStatus, StatusBoard};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` when every listener is running, `degraded` otherwise
    pub status: String,
    pub module: String,
    pub version: String,
    pub listeners: Vec<ListenerStatus>,
}

/// GET /health
pub async fn health_check(State(board): State<StatusBoard>) -> Json<HealthResponse> {
    let status = if board.all_running() { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        module: "trackbridge".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        listeners: board.snapshot(),
    })
}

pub fn health_routes(board: StatusBoard) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

/// Serve the health endpoint until `shutdown` fires
pub async fn serve(addr: SocketAddr, board: StatusBoard, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health check: http://{}/health", listener.local_addr()?);
    axum::serve(listener, health_routes(board))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
