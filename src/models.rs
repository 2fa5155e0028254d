//! Shared models and types for the frame gateway
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use crate::frame_source::VideoFrame;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub go2rtc_connected: bool,
    /// Transcoder version line, None when the startup check failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcoder: Option<String>,
    pub sessions: usize,
    pub channels: usize,
}

/// Server -> client message, one per frame
///
/// `{"image": "<base64 JPEG>", "time": "<RFC 3339 capture time>"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMessage {
    pub image: String,
    pub time: String,
}

impl FrameMessage {
    pub fn new(data: &[u8], captured_at: DateTime<Utc>) -> Self {
        Self {
            image: base64::engine::general_purpose::STANDARD.encode(data),
            time: captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&VideoFrame> for FrameMessage {
    fn from(frame: &VideoFrame) -> Self {
        Self::new(&frame.data, frame.captured_at)
    }
}
