//! Direct-feed adapter: vendor feed of discrete images -> forward

use super::types::*;
use super::{emit_terminal, forward, stop_requested, FrameSource, FrameSourceConnection, ProducerHandle};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

/// Non-transcoding frame source
pub struct DirectFeedSource {
    opener: Arc<dyn FeedOpener>,
    read_timeout: Duration,
}

impl DirectFeedSource {
    pub fn new(opener: Arc<dyn FeedOpener>, read_timeout: Duration) -> Self {
        Self { opener, read_timeout }
    }
}

#[async_trait]
impl FrameSource for DirectFeedSource {
    fn variant(&self) -> AdapterVariant {
        AdapterVariant::DirectFeed
    }

    async fn start(&self, params: &StartParams, sink: FrameSink) -> Result<Box<dyn FrameSourceConnection>> {
        let feed = self
            .opener
            .open_feed(&params.camera, &params.window)
            .await
            .map_err(|e| match e {
                Error::SourceUnavailable(_) | Error::Configuration(_) => e,
                other => Error::SourceUnavailable(other.to_string()),
            })?;

        tracing::info!(
            session_id = %params.session_id,
            camera_id = %params.camera.camera_id,
            "Direct feed opened"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(pump(params.session_id, feed, sink, stop_rx, self.read_timeout));

        Ok(Box::new(DirectFeedConnection {
            handle: ProducerHandle::new(stop_tx, task, Duration::from_secs(2)),
        }))
    }
}

/// Handle to one open feed
pub struct DirectFeedConnection {
    handle: ProducerHandle,
}

#[async_trait]
impl FrameSourceConnection for DirectFeedConnection {
    async fn stop(&mut self) {
        self.handle.stop().await;
    }

    fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

async fn pump(
    session_id: Uuid,
    mut feed: ImageStream,
    sink: FrameSink,
    mut stop_rx: watch::Receiver<bool>,
    read_timeout: Duration,
) {
    let mut sequence = 0u64;

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break TerminalReason::NormalStop,
            n = timeout(read_timeout, feed.next()) => n,
        };

        match next {
            Ok(Some(Ok(data))) => {
                let frame = VideoFrame {
                    data,
                    captured_at: Utc::now(),
                    sequence,
                };
                sequence += 1;
                if !forward(&sink, FrameEvent::Frame(frame), &mut stop_rx).await {
                    break TerminalReason::NormalStop;
                }
            }
            Ok(Some(Err(e))) => break TerminalReason::SourceError(e.to_string()),
            Ok(None) => break TerminalReason::NormalStop,
            Err(_) => break TerminalReason::Timeout,
        }
    };

    // Release the vendor connection before reporting
    drop(feed);

    tracing::info!(session_id = %session_id, reason = %reason, "Direct feed terminated");
    emit_terminal(&sink, reason, &mut stop_rx).await;
}
