//! SessionController data types

use crate::camera_directory::CameraSelector;
use crate::error::{Error, Result};
use crate::frame_source::{AdapterVariant, Resolution, TimeWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Default first-frame window (15 seconds)
pub const DEFAULT_START_TIMEOUT_SEC: u64 = 15;
/// Default producer -> controller queue depth
pub const DEFAULT_FRAME_QUEUE: usize = 16;
/// Default concurrent session limit
pub const DEFAULT_MAX_SESSIONS: usize = 32;
/// Closed sessions kept for status queries
pub const RECENTLY_CLOSED_LIMIT: usize = 128;

/// Session lifecycle state
///
/// Idle -> Connecting -> Streaming -> Stopping -> Closed, with Error
/// reachable from Connecting/Streaming and Streaming -> Connecting on seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
    Error,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    fn rank(&self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Connecting => 1,
            SessionState::Streaming => 2,
            SessionState::Stopping | SessionState::Error => 3,
            SessionState::Closed => 4,
        }
    }

    /// Whether `self -> to` is a legal edge
    pub fn can_transition(&self, to: SessionState) -> bool {
        match (self, to) {
            (SessionState::Streaming, SessionState::Connecting) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session controller configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fail start (and seek) when no frame arrives within this window
    pub start_timeout: Duration,
    pub frame_queue: usize,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SEC),
            frame_queue: DEFAULT_FRAME_QUEUE,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Start request
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub camera: CameraSelector,
    pub window: TimeWindow,
    pub resolution: Option<Resolution>,
    pub speed: f32,
}

impl StreamRequest {
    pub fn live(camera: CameraSelector) -> Self {
        Self {
            camera,
            window: TimeWindow::Live,
            resolution: None,
            speed: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_speed(self.speed)?;
        validate_window(&self.window)?;
        if let Some(r) = self.resolution {
            if r.width == 0 || r.height == 0 {
                return Err(Error::Validation("resolution must be non-zero".to_string()));
            }
        }
        Ok(())
    }
}

/// Seek / speed change on a streaming session
#[derive(Debug, Clone, PartialEq)]
pub struct SeekRequest {
    pub window: TimeWindow,
    /// Keeps the current speed when None
    pub speed: Option<f32>,
}

impl SeekRequest {
    pub fn validate(&self) -> Result<()> {
        if let Some(speed) = self.speed {
            validate_speed(speed)?;
        }
        validate_window(&self.window)
    }
}

fn validate_speed(speed: f32) -> Result<()> {
    if !speed.is_finite() || speed <= 0.0 || speed > 16.0 {
        return Err(Error::Validation(format!("speed out of range: {}", speed)));
    }
    Ok(())
}

fn validate_window(window: &TimeWindow) -> Result<()> {
    if let TimeWindow::Range { start, end: Some(end) } = window {
        if end <= start {
            return Err(Error::Validation("endTime must be after startTime".to_string()));
        }
    }
    Ok(())
}

/// Point-in-time view of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    pub speed: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<AdapterVariant>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_at: Option<DateTime<Utc>>,
    pub frames_delivered: u64,
    /// Producer restarts (seek / speed changes)
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            camera_id: None,
            window: None,
            resolution: None,
            speed: 1.0,
            variant: None,
            created_at: Utc::now(),
            last_frame_at: None,
            frames_delivered: 0,
            restarts: 0,
            last_error: None,
        }
    }
}

/// Published on every state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        session_id: Uuid,
        from: SessionState,
        to: SessionState,
    },
}

/// Controller -> actor commands
pub(super) enum Command {
    Start {
        request: StreamRequest,
        reply: oneshot::Sender<Result<SessionState>>,
    },
    Seek {
        request: SeekRequest,
        reply: oneshot::Sender<Result<SessionState>>,
    },
    Stop {
        reply: oneshot::Sender<SessionState>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic_except_restart() {
        use SessionState as S;
        assert!(S::Idle.can_transition(S::Connecting));
        assert!(S::Connecting.can_transition(S::Streaming));
        assert!(S::Streaming.can_transition(S::Connecting));
        assert!(S::Connecting.can_transition(S::Error));
        assert!(S::Idle.can_transition(S::Stopping));
        assert!(S::Error.can_transition(S::Closed));
        assert!(!S::Error.can_transition(S::Stopping));
        assert!(!S::Closed.can_transition(S::Idle));
        assert!(!S::Closed.can_transition(S::Streaming));
        assert!(!S::Stopping.can_transition(S::Streaming));
        assert!(!S::Connecting.can_transition(S::Idle));
    }

    #[test]
    fn test_request_validation() {
        let mut request = StreamRequest::live(CameraSelector::Ref("CAM-1".into()));
        assert!(request.validate().is_ok());

        request.speed = 0.0;
        assert!(matches!(request.validate(), Err(Error::Validation(_))));

        request.speed = 1.0;
        request.window = TimeWindow::Range {
            start: "2026-01-05T10:00:00Z".parse().unwrap(),
            end: Some("2026-01-05T09:00:00Z".parse().unwrap()),
        };
        assert!(matches!(request.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::StateChanged {
            session_id: Uuid::nil(),
            from: SessionState::Connecting,
            to: SessionState::Streaming,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["to"], "streaming");
    }
}
