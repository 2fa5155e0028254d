//! Per-session actor
//!
//! Sole owner of the session's producer connection and frame queue; every
//! transition for one session happens on this task, in order.

use super::types::*;
use super::SessionTable;
use crate::camera_directory::CameraDirectory;
use crate::channel_registry::{ChannelRegistry, CloseReason};
use crate::error::{Error, Result};
use crate::frame_source::{
    FrameEvent, FrameSource, FrameSourceConnection, SourceSet, StartParams, TerminalReason, VideoFrame,
};
use crate::models::FrameMessage;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Lookup plus producer start, polled by the actor loop
type Launch = BoxFuture<'static, Result<Launched>>;

/// A producer that came up, with the queue it feeds
struct Launched {
    source: Arc<dyn FrameSource>,
    params: StartParams,
    conn: Box<dyn FrameSourceConnection>,
    frames_rx: mpsc::Receiver<FrameEvent>,
    restart: bool,
}

enum Step {
    Command(Option<Command>),
    Launched(Result<Launched>),
    Frame(Option<FrameEvent>),
    StartDeadline,
    ChannelClosed(Option<CloseReason>),
}

pub(super) struct SessionActor {
    pub id: Uuid,
    pub config: SessionConfig,
    pub registry: Arc<ChannelRegistry>,
    pub sources: Arc<SourceSet>,
    pub directory: Arc<dyn CameraDirectory>,
    pub table: Arc<SessionTable>,
    pub events: broadcast::Sender<SessionEvent>,
    pub snapshot_tx: watch::Sender<SessionSnapshot>,

    pub state: SessionState,
    pub source: Option<Arc<dyn FrameSource>>,
    pub conn: Option<Box<dyn FrameSourceConnection>>,
    pub params: Option<StartParams>,
    pub frames_rx: Option<mpsc::Receiver<FrameEvent>>,
    launch: Option<Launch>,
    /// Start or seek waiting for its first frame
    pub pending: Option<oneshot::Sender<Result<SessionState>>>,
    pub deadline: Option<Instant>,
}

impl SessionActor {
    pub fn new(
        id: Uuid,
        config: SessionConfig,
        registry: Arc<ChannelRegistry>,
        sources: Arc<SourceSet>,
        directory: Arc<dyn CameraDirectory>,
        table: Arc<SessionTable>,
        events: broadcast::Sender<SessionEvent>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            id,
            config,
            registry,
            sources,
            directory,
            table,
            events,
            snapshot_tx,
            state: SessionState::Idle,
            source: None,
            conn: None,
            params: None,
            frames_rx: None,
            launch: None,
            pending: None,
            deadline: None,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut closed_rx: watch::Receiver<Option<CloseReason>>,
    ) {
        while !self.state.is_closed() {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                launched = launch_done(&mut self.launch) => Step::Launched(launched),
                event = next_event(&mut self.frames_rx) => Step::Frame(event),
                _ = deadline_elapsed(self.deadline) => Step::StartDeadline,
                changed = closed_rx.changed() => {
                    let reason = match changed {
                        Ok(()) => *closed_rx.borrow(),
                        Err(_) => None,
                    };
                    Step::ChannelClosed(reason)
                }
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => self.teardown(None, CloseReason::SessionEnded).await,
                Step::Launched(result) => {
                    self.launch = None;
                    self.on_launched(result).await;
                }
                Step::Frame(Some(FrameEvent::Frame(frame))) => self.deliver(frame).await,
                Step::Frame(Some(FrameEvent::Terminated(reason))) => self.on_terminated(reason).await,
                Step::Frame(None) => {
                    self.on_terminated(TerminalReason::SourceError("producer exited without a terminal event".into()))
                        .await
                }
                Step::StartDeadline => {
                    let err = Error::Timeout(format!(
                        "no frame within {}ms",
                        self.config.start_timeout.as_millis()
                    ));
                    tracing::warn!(session_id = %self.id, "Start timed out waiting for first frame");
                    self.teardown(Some(err), CloseReason::SourceFailed).await;
                }
                Step::ChannelClosed(reason) => {
                    let reason = reason.unwrap_or(CloseReason::ClientDisconnected);
                    tracing::info!(session_id = %self.id, reason = reason.as_str(), "Channel gone, ending session");
                    let failure = self
                        .pending
                        .is_some()
                        .then(|| Error::ChannelClosed(format!("channel closed: {}", reason.as_str())));
                    self.teardown(failure, reason).await;
                }
            }
        }

        let last = self.snapshot_tx.borrow().clone();
        self.table.retire(last).await;
        tracing::debug!(session_id = %self.id, "Session actor finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                if self.state != SessionState::Idle {
                    let _ = reply.send(Err(Error::InvalidState(format!(
                        "session is {}; use seek to change position or speed",
                        self.state
                    ))));
                    return;
                }
                self.start(request, reply);
            }
            Command::Seek { request, reply } => {
                if self.state != SessionState::Streaming {
                    let _ = reply.send(Err(Error::InvalidState(format!(
                        "seek requires a streaming session, session is {}",
                        self.state
                    ))));
                    return;
                }
                self.seek(request, reply);
            }
            Command::Stop { reply } => {
                self.teardown(None, CloseReason::SessionEnded).await;
                let _ = reply.send(self.state);
            }
        }
    }

    /// Idle -> Connecting; lookup and producer start run as the actor's launch
    fn start(&mut self, request: StreamRequest, reply: oneshot::Sender<Result<SessionState>>) {
        self.transition(SessionState::Connecting);
        // Failures from here on are reported through the pending reply
        self.pending = Some(reply);
        self.deadline = Some(Instant::now() + self.config.start_timeout);
        self.snapshot_tx.send_modify(|s| {
            s.window = Some(request.window.clone());
            s.resolution = request.resolution;
            s.speed = request.speed;
        });

        let directory = self.directory.clone();
        let sources = self.sources.clone();
        let session_id = self.id;
        let queue = self.config.frame_queue.max(1);

        self.launch = Some(Box::pin(async move {
            let camera = directory.lookup(&request.camera).await?;
            let source = sources.select(&camera.family)?;
            let params = StartParams {
                session_id,
                camera,
                window: request.window,
                resolution: request.resolution,
                speed: request.speed,
            };
            tracing::info!(
                session_id = %session_id,
                camera_id = %params.camera.camera_id,
                variant = ?source.variant(),
                live = params.window.is_live(),
                "Starting frame source"
            );
            open(source, params, queue).await
        }));
    }

    /// Streaming -> Connecting via restart; the channel stays bound
    fn seek(&mut self, request: SeekRequest, reply: oneshot::Sender<Result<SessionState>>) {
        let (Some(source), Some(mut params)) = (self.source.clone(), self.params.clone()) else {
            let _ = reply.send(Err(Error::Internal("streaming session without a source".to_string())));
            return;
        };
        params.window = request.window;
        if let Some(speed) = request.speed {
            params.speed = speed;
        }

        self.transition(SessionState::Connecting);
        self.pending = Some(reply);
        self.deadline = Some(Instant::now() + self.config.start_timeout);

        // Old queue goes first so nothing from the previous producer is delivered
        self.frames_rx = None;
        let mut previous = self.conn.take();
        let queue = self.config.frame_queue.max(1);

        self.launch = Some(Box::pin(async move {
            let (sink, frames_rx) = mpsc::channel(queue);
            let conn = source.restart(&mut previous, &params, sink).await?;
            Ok(Launched {
                source,
                params,
                conn,
                frames_rx,
                restart: true,
            })
        }));
    }

    async fn on_launched(&mut self, result: Result<Launched>) {
        let launched = match result {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Frame source start failed");
                return self.teardown(Some(e), CloseReason::SourceFailed).await;
            }
        };

        let Launched {
            source,
            params,
            mut conn,
            frames_rx,
            restart,
        } = launched;

        if self.state != SessionState::Connecting {
            conn.stop().await;
            return;
        }

        let variant = source.variant();
        self.snapshot_tx.send_modify(|s| {
            s.camera_id = Some(params.camera.camera_id.clone());
            s.window = Some(params.window.clone());
            s.speed = params.speed;
            s.variant = Some(variant);
            if restart {
                s.restarts += 1;
            }
        });
        if restart {
            tracing::info!(session_id = %self.id, speed = params.speed, "Frame source restarted");
        }

        self.conn = Some(conn);
        self.frames_rx = Some(frames_rx);
        self.source = Some(source);
        self.params = Some(params);
    }

    async fn deliver(&mut self, frame: VideoFrame) {
        let payload = match FrameMessage::from(&frame).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Frame encode failed, dropping");
                return;
            }
        };

        if let Err(e) = self.registry.send(&self.id, payload).await {
            // Channel closure arrives on the closed signal
            tracing::debug!(session_id = %self.id, error = %e, "Frame not delivered");
            return;
        }

        self.snapshot_tx.send_modify(|s| {
            s.frames_delivered += 1;
            s.last_frame_at = Some(frame.captured_at);
        });

        if self.state == SessionState::Connecting {
            self.deadline = None;
            self.transition(SessionState::Streaming);
            if let Some(reply) = self.pending.take() {
                let _ = reply.send(Ok(SessionState::Streaming));
            }
        }
    }

    async fn on_terminated(&mut self, reason: TerminalReason) {
        tracing::info!(session_id = %self.id, reason = %reason, state = %self.state, "Frame source terminated");
        let awaiting_first_frame = self.pending.is_some();

        let (failure, close) = match reason {
            TerminalReason::NormalStop if !awaiting_first_frame => (None, CloseReason::SessionEnded),
            TerminalReason::NormalStop => (
                Some(Error::SourceUnavailable("source ended before the first frame".to_string())),
                CloseReason::SourceFailed,
            ),
            TerminalReason::SourceError(e) => (Some(Error::SourceUnavailable(e)), CloseReason::SourceFailed),
            TerminalReason::Timeout => (
                Some(Error::Timeout("frame source stalled".to_string())),
                CloseReason::SourceFailed,
            ),
        };
        self.teardown(failure, close).await;
    }

    /// Single cleanup path: producer stop, channel close, pending reply, Closed
    async fn teardown(&mut self, failure: Option<Error>, close: CloseReason) {
        if self.state.is_closed() {
            return;
        }

        let message = failure.as_ref().map(|e| e.to_string());
        match &failure {
            Some(e) => {
                tracing::warn!(session_id = %self.id, error_code = e.code(), error = %e, "Session failed");
                self.transition(SessionState::Error);
            }
            None => self.transition(SessionState::Stopping),
        }

        if self.launch.take().is_some() {
            tracing::debug!(session_id = %self.id, "Abandoning in-flight start");
        }
        if let Some(mut conn) = self.conn.take() {
            conn.stop().await;
        }
        self.frames_rx = None;
        self.deadline = None;
        self.source = None;

        self.registry.close(&self.id, close).await;

        if let Some(reply) = self.pending.take() {
            let err = failure.unwrap_or_else(|| Error::ChannelClosed("session stopped before first frame".to_string()));
            let _ = reply.send(Err(err));
        }

        if message.is_some() {
            self.snapshot_tx.send_modify(|s| s.last_error = message);
        }
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to || !from.can_transition(to) {
            tracing::debug!(session_id = %self.id, from = %from, to = %to, "Transition ignored");
            return;
        }

        self.state = to;
        self.snapshot_tx.send_modify(|s| s.state = to);
        let _ = self.events.send(SessionEvent::StateChanged {
            session_id: self.id,
            from,
            to,
        });
        tracing::info!(session_id = %self.id, from = %from, to = %to, "Session state changed");
    }
}

async fn open(source: Arc<dyn FrameSource>, params: StartParams, queue: usize) -> Result<Launched> {
    let (sink, frames_rx) = mpsc::channel(queue);
    let conn = source.start(&params, sink).await?;
    Ok(Launched {
        source,
        params,
        conn,
        frames_rx,
        restart: false,
    })
}

async fn launch_done(launch: &mut Option<Launch>) -> Result<Launched> {
    match launch {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_event(frames_rx: &mut Option<mpsc::Receiver<FrameEvent>>) -> Option<FrameEvent> {
    match frames_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
