//! Application state
//!
//! Holds all shared components and state

use crate::channel_registry::{ChannelRegistry, RegistryConfig, DEFAULT_PING_TIMEOUT_SEC};
use crate::frame_source::TranscoderConfig;
use crate::heartbeat_monitor::{HeartbeatConfig, DEFAULT_SWEEP_INTERVAL_SEC};
use crate::session_controller::{SessionConfig, SessionController};
use crate::stream_gateway::StreamGateway;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Base of the endpoint addresses handed to clients
    pub public_ws_base: String,
    /// go2rtc URL
    pub go2rtc_url: String,
    /// go2rtc RTSP restream base
    pub go2rtc_rtsp_url: String,
    /// Vendor playback (historical locator) API
    pub playback_api_url: Option<String>,
    /// Camera registry API; takes precedence over camera_config_path
    pub camera_api_url: Option<String>,
    /// Static camera list (JSON)
    pub camera_config_path: Option<PathBuf>,
    pub ffmpeg_path: String,
    pub stream_fps: u32,
    /// `family=variant,...`
    pub source_bindings: String,
    pub max_sessions: usize,
    pub max_transcoders: usize,
    pub channel_queue_capacity: usize,
    pub heartbeat_interval_sec: u64,
    pub inactivity_timeout_sec: u64,
    pub start_timeout_sec: u64,
    pub read_timeout_sec: u64,
    pub stop_grace_ms: u64,
    /// Frames larger than this are dropped by the demuxer
    pub max_frame_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8090),
            public_ws_base: env_or("PUBLIC_WS_BASE", "ws://localhost:8090"),
            go2rtc_url: env_or("GO2RTC_URL", "http://localhost:1984"),
            go2rtc_rtsp_url: env_or("GO2RTC_RTSP_URL", "rtsp://localhost:8554"),
            playback_api_url: std::env::var("PLAYBACK_API_URL").ok(),
            camera_api_url: std::env::var("CAMERA_API_URL").ok(),
            camera_config_path: std::env::var("CAMERA_CONFIG_PATH").map(PathBuf::from).ok(),
            ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
            stream_fps: env_parse("STREAM_FPS", crate::frame_source::DEFAULT_FPS),
            source_bindings: env_or("SOURCE_BINDINGS", "default=pipeline"),
            max_sessions: env_parse("MAX_SESSIONS", crate::session_controller::DEFAULT_MAX_SESSIONS),
            max_transcoders: env_parse("MAX_TRANSCODERS", crate::frame_source::DEFAULT_MAX_TRANSCODERS),
            channel_queue_capacity: env_parse(
                "CHANNEL_QUEUE_CAPACITY",
                crate::channel_registry::DEFAULT_QUEUE_CAPACITY,
            ),
            heartbeat_interval_sec: env_parse(
                "HEARTBEAT_INTERVAL_SEC",
                crate::heartbeat_monitor::DEFAULT_HEARTBEAT_INTERVAL_SEC,
            ),
            inactivity_timeout_sec: env_parse(
                "INACTIVITY_TIMEOUT_SEC",
                crate::channel_registry::DEFAULT_INACTIVITY_TIMEOUT_SEC,
            ),
            start_timeout_sec: env_parse(
                "START_TIMEOUT_SEC",
                crate::session_controller::DEFAULT_START_TIMEOUT_SEC,
            ),
            read_timeout_sec: env_parse(
                "READ_TIMEOUT_SEC",
                crate::frame_source::DEFAULT_READ_TIMEOUT_SEC,
            ),
            stop_grace_ms: env_parse(
                "STOP_GRACE_MS",
                crate::frame_source::DEFAULT_STOP_GRACE_MS,
            ),
            max_frame_bytes: env_parse(
                "MAX_FRAME_BYTES",
                crate::frame_source::DEFAULT_MAX_FRAME_BYTES,
            ),
        }
    }
}

impl AppConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            queue_capacity: self.channel_queue_capacity.max(1),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_sec),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SEC),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_sec.max(1)),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SEC),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            start_timeout: Duration::from_secs(self.start_timeout_sec.max(1)),
            max_sessions: self.max_sessions.max(1),
            ..Default::default()
        }
    }

    pub fn transcoder_config(&self) -> TranscoderConfig {
        TranscoderConfig {
            program: self.ffmpeg_path.clone(),
            fps: self.stream_fps.max(1),
            read_timeout: Duration::from_secs(self.read_timeout_sec.max(1)),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            ..Default::default()
        }
    }

    /// Client-facing endpoint address for a session
    pub fn endpoint_for(&self, session_id: &uuid::Uuid) -> String {
        format!(
            "{}/ws/stream/{}",
            self.public_ws_base.trim_end_matches('/'),
            session_id
        )
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionController>,
    pub registry: Arc<ChannelRegistry>,
    pub stream: Arc<StreamGateway>,
    /// Transcoder version line from the startup check
    pub transcoder_version: Option<String>,
    pub started_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_for_trims_trailing_slash() {
        let config = AppConfig {
            public_ws_base: "wss://gw.example.com/".to_string(),
            ..AppConfig::default()
        };
        let id = uuid::Uuid::nil();
        assert_eq!(
            config.endpoint_for(&id),
            "wss://gw.example.com/ws/stream/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_component_configs_clamp_zero_values() {
        let config = AppConfig {
            channel_queue_capacity: 0,
            stream_fps: 0,
            max_sessions: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.registry_config().queue_capacity, 1);
        assert_eq!(config.transcoder_config().fps, 1);
        assert_eq!(config.session_config().max_sessions, 1);
    }

    #[test]
    fn test_max_frame_bytes_defaults_to_demuxer_bound() {
        std::env::remove_var("MAX_FRAME_BYTES");
        let config = AppConfig::default();
        assert_eq!(config.max_frame_bytes, crate::frame_source::DEFAULT_MAX_FRAME_BYTES);
    }
}
