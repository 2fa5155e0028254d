//! FrameSource data types

use crate::camera_directory::CameraSource;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Adapter variant, chosen per vendor family by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterVariant {
    /// Locator resolution + supervised transcoding process
    Pipeline,
    /// Vendor feed that already yields discrete images
    DirectFeed,
}

impl std::str::FromStr for AdapterVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pipeline" => Ok(AdapterVariant::Pipeline),
            "direct_feed" | "direct-feed" | "feed" => Ok(AdapterVariant::DirectFeed),
            other => Err(format!("unknown adapter variant: {}", other)),
        }
    }
}

/// Requested time window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeWindow {
    Live,
    /// Historical footage; open-ended when `end` is None
    Range {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
}

impl TimeWindow {
    pub fn is_live(&self) -> bool {
        matches!(self, TimeWindow::Live)
    }
}

/// Target output resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Parameters for one producer start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    pub session_id: Uuid,
    pub camera: CameraSource,
    pub window: TimeWindow,
    pub resolution: Option<Resolution>,
    /// Playback speed multiplier (1.0 = real time)
    pub speed: f32,
}

/// One encoded still image
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    /// Local observation time (not from the stream)
    pub captured_at: DateTime<Utc>,
    /// Production order within one producer
    pub sequence: u64,
}

/// Why a producer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    NormalStop,
    SourceError(String),
    Timeout,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::NormalStop => write!(f, "normal stop"),
            TerminalReason::SourceError(e) => write!(f, "source error: {}", e),
            TerminalReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// Producer -> controller events
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Frame(VideoFrame),
    /// Emitted exactly once, last
    Terminated(TerminalReason),
}

/// Bounded producer -> controller queue
pub type FrameSink = mpsc::Sender<FrameEvent>;

/// Discrete image stream yielded by a vendor feed
pub type ImageStream = BoxStream<'static, Result<Bytes>>;

/// Vendor capability: time-scoped transport locator (pipeline variant)
#[async_trait]
pub trait LocatorResolver: Send + Sync {
    async fn resolve_locator(&self, camera: &CameraSource, window: &TimeWindow) -> Result<String>;
}

/// Vendor capability: discrete-image feed (direct-feed variant)
#[async_trait]
pub trait FeedOpener: Send + Sync {
    async fn open_feed(&self, camera: &CameraSource, window: &TimeWindow) -> Result<ImageStream>;
}
