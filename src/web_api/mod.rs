//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Stream control routes (obtain endpoint, start, seek, stop, status)
//! - WebSocket attach for session channels
//! - Health reporting

mod routes;
mod stream_socket;

pub use routes::create_router;
pub use stream_socket::WsTransport;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let go2rtc_ok = state.stream.health_check().await.unwrap_or(false);

    let status = if state.transcoder_version.is_some() {
        "ok"
    } else {
        "degraded"
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        go2rtc_connected: go2rtc_ok,
        transcoder: state.transcoder_version.clone(),
        sessions: state.sessions.live_count().await,
        channels: state.registry.len().await,
    };

    Json(response)
}
