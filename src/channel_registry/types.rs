//! ChannelRegistry data types

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

/// Default outbound queue capacity per channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
/// Default inactivity window (no successful send or ping)
pub const DEFAULT_INACTIVITY_TIMEOUT_SEC: u64 = 30;
/// Default bound on a single ping round
pub const DEFAULT_PING_TIMEOUT_SEC: u64 = 10;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Outbound queue capacity; oldest item is dropped when full
    pub queue_capacity: usize,
    /// Close channels with no successful send/ping within this window
    pub inactivity_timeout: Duration,
    /// Ping round bound; exceeding it counts as a ping failure
    pub ping_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SEC),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SEC),
        }
    }
}

/// Why a channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent a close frame or the socket dropped
    ClientDisconnected,
    /// Writing to the transport failed
    SendFailed,
    /// Heartbeat ping failed
    PingFailed,
    /// No successful send/ping within the inactivity window
    Inactive,
    /// Owning session finished normally
    SessionEnded,
    /// Owning session finished with a source failure
    SourceFailed,
}

impl CloseReason {
    /// WebSocket close code sent to the client
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::ClientDisconnected | CloseReason::SessionEnded => 1000,
            CloseReason::SendFailed | CloseReason::PingFailed | CloseReason::Inactive => 1001,
            CloseReason::SourceFailed => 1011,
        }
    }

    /// Short human-readable reason sent in the close frame
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client disconnected",
            CloseReason::SendFailed => "send failed",
            CloseReason::PingFailed => "heartbeat failed",
            CloseReason::Inactive => "inactive",
            CloseReason::SessionEnded => "session ended",
            CloseReason::SourceFailed => "source error",
        }
    }
}

/// Duplex transport bound to a channel (server -> client half)
///
/// The registry owns the attached transport; nothing else writes to it.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Deliver one text message
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Liveness ping; completes once the peer has answered
    async fn ping(&mut self) -> Result<()>;

    /// Send a close frame; errors are ignored since the channel is going away
    async fn close(&mut self, reason: CloseReason);
}

/// Commands serviced by a channel's writer task alongside queued payloads
pub(super) enum WriterCommand {
    Ping(oneshot::Sender<bool>),
}

/// Point-in-time view of a registry slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub session_id: uuid::Uuid,
    pub attached: bool,
    /// Milliseconds since the last successful send or ping (or since reserve)
    pub idle_ms: u64,
}
