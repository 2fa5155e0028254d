//! Pipeline adapter: locator -> supervised transcoder -> JPEG demux

use super::demuxer::{JpegDemuxer, DEFAULT_MAX_FRAME_BYTES};
use super::transcoder::{TranscoderConfig, TranscoderProcess};
use super::types::*;
use super::{emit_terminal, forward, stop_requested, FrameSource, FrameSourceConnection, ProducerHandle};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Default concurrent transcoder limit
pub const DEFAULT_MAX_TRANSCODERS: usize = 16;

/// Transcoding frame source
pub struct PipelineSource {
    resolver: Arc<dyn LocatorResolver>,
    config: TranscoderConfig,
    /// One permit per running transcoder
    permits: Arc<Semaphore>,
    max_frame_bytes: usize,
}

impl PipelineSource {
    pub fn new(resolver: Arc<dyn LocatorResolver>, config: TranscoderConfig, max_transcoders: usize) -> Self {
        Self {
            resolver,
            config,
            permits: Arc::new(Semaphore::new(max_transcoders.max(1))),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Transcoders that may still be started
    pub fn available_transcoders(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl FrameSource for PipelineSource {
    fn variant(&self) -> AdapterVariant {
        AdapterVariant::Pipeline
    }

    async fn start(&self, params: &StartParams, sink: FrameSink) -> Result<Box<dyn FrameSourceConnection>> {
        let locator = self
            .resolver
            .resolve_locator(&params.camera, &params.window)
            .await
            .map_err(|e| match e {
                Error::SourceUnavailable(_) | Error::Configuration(_) => e,
                other => Error::SourceUnavailable(other.to_string()),
            })?;

        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            Error::ResourceExhaustion("Transcoder limit reached".to_string())
        })?;

        let process = TranscoderProcess::spawn(&self.config, &locator, params)?;
        let pid = process.pid();

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Supervisor {
            session_id: params.session_id,
            process,
            sink,
            stop_rx,
            demuxer: JpegDemuxer::new(self.max_frame_bytes),
            read_chunk: self.config.read_chunk.max(4096),
            grace: self.config.stop_grace,
            _permit: permit,
        };
        let task = tokio::spawn(worker.run());

        // SIGTERM grace + SIGKILL wait + slack
        let stop_bound = self.config.stop_grace * 2 + Duration::from_secs(1);

        Ok(Box::new(PipelineConnection {
            handle: ProducerHandle::new(stop_tx, task, stop_bound),
            pid,
        }))
    }
}

/// Handle to one running transcoder
pub struct PipelineConnection {
    handle: ProducerHandle,
    pid: Option<u32>,
}

#[async_trait]
impl FrameSourceConnection for PipelineConnection {
    async fn stop(&mut self) {
        self.handle.stop().await;
    }

    fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}

enum Outcome {
    Stopped,
    EndOfStream,
    Timeout,
    Failed(String),
}

struct Supervisor {
    session_id: Uuid,
    process: TranscoderProcess,
    sink: FrameSink,
    stop_rx: watch::Receiver<bool>,
    demuxer: JpegDemuxer,
    read_chunk: usize,
    grace: Duration,
    _permit: OwnedSemaphorePermit,
}

impl Supervisor {
    async fn run(mut self) {
        let outcome = self.pump().await;

        let reason = match outcome {
            Outcome::Stopped => {
                self.process.shutdown(self.grace).await;
                TerminalReason::NormalStop
            }
            Outcome::EndOfStream => {
                self.process.wait_exit(self.grace).await;
                let summary = self.process.shutdown(self.grace).await;
                if summary.success() {
                    TerminalReason::NormalStop
                } else {
                    TerminalReason::SourceError(format!("transcoder exited: {}", summary.describe()))
                }
            }
            Outcome::Timeout => {
                self.process.shutdown(self.grace).await;
                TerminalReason::Timeout
            }
            Outcome::Failed(e) => {
                self.process.shutdown(self.grace).await;
                TerminalReason::SourceError(e)
            }
        };

        tracing::info!(
            session_id = %self.session_id,
            reason = %reason,
            dropped_frames = self.demuxer.dropped(),
            "Pipeline producer terminated"
        );
        emit_terminal(&self.sink, reason, &mut self.stop_rx).await;
    }

    async fn pump(&mut self) -> Outcome {
        let mut buf = vec![0u8; self.read_chunk];
        let mut sequence = 0u64;

        loop {
            let read = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => return Outcome::Stopped,
                r = self.process.read(&mut buf) => r,
            };

            let n = match read {
                Ok(0) => return Outcome::EndOfStream,
                Ok(n) => n,
                Err(Error::Timeout(_)) => return Outcome::Timeout,
                Err(e) => return Outcome::Failed(e.to_string()),
            };

            for data in self.demuxer.push(&buf[..n]) {
                let frame = VideoFrame {
                    data,
                    captured_at: Utc::now(),
                    sequence,
                };
                sequence += 1;
                if !forward(&self.sink, FrameEvent::Frame(frame), &mut self.stop_rx).await {
                    return Outcome::Stopped;
                }
            }
        }
    }
}
