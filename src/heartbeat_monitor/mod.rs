//! HeartbeatMonitor - Channel Liveness Driver
//!
//! Periodically asks the ChannelRegistry to ping every open channel and to
//! close channels that have been silent past the inactivity window.
//! Independent of the session controller: it only sees session IDs.

use crate::channel_registry::ChannelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default ping interval (60 seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_SEC: u64 = 60;
/// Default inactivity sweep interval (5 seconds)
pub const DEFAULT_SWEEP_INTERVAL_SEC: u64 = 5;

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Ping round interval
    pub interval: Duration,
    /// Inactivity sweep interval; shorter than the inactivity window
    pub sweep_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SEC),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SEC),
        }
    }
}

/// HeartbeatMonitor instance
pub struct HeartbeatMonitor {
    registry: Arc<ChannelRegistry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ChannelRegistry>, config: HeartbeatConfig) -> Self {
        Self { registry, config }
    }

    /// Spawn the monitor loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!(
            interval_sec = self.config.interval.as_secs(),
            sweep_interval_sec = self.config.sweep_interval.as_secs(),
            "Heartbeat monitor started"
        );

        tokio::spawn(async move {
            let mut ping_tick = tokio::time::interval(self.config.interval);
            let mut sweep_tick = tokio::time::interval(self.config.sweep_interval);
            ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick of an interval completes immediately
            ping_tick.tick().await;
            sweep_tick.tick().await;

            loop {
                tokio::select! {
                    _ = ping_tick.tick() => self.ping_round().await,
                    _ = sweep_tick.tick() => self.sweep_round().await,
                }
            }
        })
    }

    /// One ping round over all open channels
    pub async fn ping_round(&self) {
        let open = self.registry.len().await;
        let closed = self.registry.ping_all().await;
        if closed > 0 {
            tracing::info!(open = open, closed = closed, "Heartbeat round closed dead channels");
        } else {
            tracing::debug!(open = open, "Heartbeat round");
        }
    }

    /// One inactivity sweep
    pub async fn sweep_round(&self) {
        let closed = self.registry.sweep_inactive().await;
        for session_id in &closed {
            tracing::info!(session_id = %session_id, "Inactive channel closed");
        }
    }
}
