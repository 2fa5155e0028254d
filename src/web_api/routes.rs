//! API Routes

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stream_socket::handle_stream_socket;
use crate::camera_directory::CameraSelector;
use crate::channel_registry::ChannelInfo;
use crate::error::{Error, Result};
use crate::frame_source::{Resolution, TimeWindow};
use crate::models::ApiResponse;
use crate::session_controller::{SeekRequest, SessionSnapshot, SessionState, StreamRequest};
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Sessions
        .route("/api/stream/sessions", post(create_session))
        .route("/api/stream/sessions", get(list_sessions))
        .route("/api/stream/sessions/:id", get(get_session))
        // Stream control
        .route("/api/stream/start", post(start_stream))
        .route("/api/stream/seek", post(seek_stream))
        .route("/api/stream/stop", post(stop_stream))
        // Channel attach
        .route("/ws/stream/:session_id", get(stream_websocket))
        .with_state(state)
}

// ========================================
// Request / response bodies
// ========================================

/// Obtain-endpoint response
#[derive(Debug, Serialize)]
struct SessionEndpoint {
    session_id: Uuid,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct SessionStateResponse {
    session_id: Uuid,
    state: SessionState,
}

/// GET /api/stream/sessions/:id
#[derive(Debug, Serialize)]
struct SessionDetail {
    #[serde(flatten)]
    session: SessionSnapshot,
    /// Absent once the channel is closed
    channel: Option<ChannelInfo>,
}

/// POST /api/stream/start
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStreamBody {
    #[serde(rename = "sessionID", alias = "sessionId")]
    session_id: Uuid,
    camera_ref: Option<String>,
    camera_config_id: Option<String>,
    /// Absent means live
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    width: Option<u32>,
    height: Option<u32>,
    speed: Option<f32>,
}

impl StartStreamBody {
    fn into_request(self) -> Result<(Uuid, StreamRequest)> {
        let camera = match (self.camera_config_id, self.camera_ref) {
            (Some(id), _) if !id.trim().is_empty() => CameraSelector::ConfigId(id),
            (_, Some(r)) if !r.trim().is_empty() => CameraSelector::Ref(r),
            _ => {
                return Err(Error::Validation(
                    "cameraRef or cameraConfigId is required".to_string(),
                ))
            }
        };

        let resolution = match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Resolution { width, height }),
            (None, None) => None,
            _ => {
                return Err(Error::Validation(
                    "width and height must be given together".to_string(),
                ))
            }
        };

        let request = StreamRequest {
            camera,
            window: time_window(self.start_time, self.end_time)?,
            resolution,
            speed: self.speed.unwrap_or(1.0),
        };
        Ok((self.session_id, request))
    }
}

/// POST /api/stream/seek
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeekStreamBody {
    #[serde(rename = "sessionID", alias = "sessionId")]
    session_id: Uuid,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    speed: Option<f32>,
}

/// POST /api/stream/stop
#[derive(Debug, Deserialize)]
struct StopStreamBody {
    #[serde(rename = "sessionID", alias = "sessionId")]
    session_id: Uuid,
}

fn time_window(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<TimeWindow> {
    match (start, end) {
        (None, None) => Ok(TimeWindow::Live),
        (Some(start), end) => Ok(TimeWindow::Range { start, end }),
        (None, Some(_)) => Err(Error::Validation("endTime requires startTime".to_string())),
    }
}

// ========================================
// Session Handlers
// ========================================

/// Issue a session ID and its channel endpoint
async fn create_session(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let session_id = state.sessions.create_session().await?;
    let endpoint = state.config.endpoint_for(&session_id);

    tracing::info!(session_id = %session_id, endpoint = %endpoint, "Session endpoint issued");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(SessionEndpoint {
            session_id,
            endpoint,
        })),
    ))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.sessions.list().await))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    let snapshot = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
    let channel = state.registry.info(&id).await;
    Ok(Json(ApiResponse::success(SessionDetail {
        session: snapshot,
        channel,
    })))
}

// ========================================
// Stream Control Handlers
// ========================================

/// Start streaming; responds once the first frame is produced or start fails
async fn start_stream(
    State(state): State<AppState>,
    Json(body): Json<StartStreamBody>,
) -> Result<impl IntoResponse> {
    let (session_id, request) = body.into_request()?;
    let session_state = state.sessions.start(session_id, request).await?;

    Ok(Json(ApiResponse::success(SessionStateResponse {
        session_id,
        state: session_state,
    })))
}

/// Reposition or change speed of a streaming session
async fn seek_stream(
    State(state): State<AppState>,
    Json(body): Json<SeekStreamBody>,
) -> Result<impl IntoResponse> {
    let request = SeekRequest {
        window: time_window(body.start_time, body.end_time)?,
        speed: body.speed,
    };
    let session_state = state.sessions.seek(body.session_id, request).await?;

    Ok(Json(ApiResponse::success(SessionStateResponse {
        session_id: body.session_id,
        state: session_state,
    })))
}

/// Idempotent stop
async fn stop_stream(
    State(state): State<AppState>,
    Json(body): Json<StopStreamBody>,
) -> impl IntoResponse {
    let session_state = state.sessions.stop(body.session_id).await;

    Json(ApiResponse::success(SessionStateResponse {
        session_id: body.session_id,
        state: session_state,
    }))
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler; only reserved sessions may attach
async fn stream_websocket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    if !state.registry.contains(&session_id).await {
        return Err(Error::UnknownSession(session_id.to_string()));
    }
    Ok(ws.on_upgrade(move |socket| handle_stream_socket(socket, session_id, state)))
}
