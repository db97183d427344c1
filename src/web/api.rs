use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use super::server::WebState;
use crate::container::ContainerStatus;

/// Health and status routes
pub fn api_routes() -> Router<Arc<WebState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/terminal/status", get(terminal_status))
        .route("/api/terminal/stats", get(terminal_stats))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    terminal_available: bool,
    container_status: String,
}

async fn health(
    State(state): State<Arc<WebState>>,
) -> Result<Json<HealthResponse>, StatusCode> {
    let status = state.bridge.runtime().status().await;
    if !status.running {
        tracing::error!(container_status = %status.status, "Health check failed");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(HealthResponse {
        status: "healthy",
        terminal_available: true,
        container_status: status.status,
    }))
}

async fn terminal_status(State(state): State<Arc<WebState>>) -> Json<ContainerStatus> {
    Json(state.bridge.runtime().status().await)
}

#[derive(Serialize)]
struct StatsResponse {
    active_connections: u64,
    rate_limit_degraded: u64,
}

async fn terminal_stats(State(state): State<Arc<WebState>>) -> Json<StatsResponse> {
    let limiter = state.bridge.limiter();
    Json(StatsResponse {
        active_connections: limiter.active_count().await,
        rate_limit_degraded: limiter.degraded_count(),
    })
}
