//! SessionController - Streaming Session Lifecycle
//!
//! ## Responsibilities
//!
//! - Session allocation (ID + reserved channel slot) with admission limit
//! - Start / Seek / Stop driving the per-session state machine
//! - Frame delivery: producer queue -> `{"image","time"}` -> channel registry
//! - Snapshots and transition events for observers
//!
//! Each session runs as its own actor task; sessions never block one another.

mod actor;
mod types;

pub use types::*;

use crate::camera_directory::CameraDirectory;
use crate::channel_registry::ChannelRegistry;
use crate::error::{Error, Result};
use crate::frame_source::SourceSet;
use actor::SessionActor;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use uuid::Uuid;

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

/// Live sessions plus a short history of closed ones
pub(crate) struct SessionTable {
    live: RwLock<HashMap<Uuid, SessionHandle>>,
    recent: RwLock<VecDeque<SessionSnapshot>>,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            recent: RwLock::new(VecDeque::new()),
        }
    }

    /// Move a finished session from live to recent
    async fn retire(&self, snapshot: SessionSnapshot) {
        let id = snapshot.session_id;
        {
            let mut recent = self.recent.write().await;
            recent.push_back(snapshot);
            while recent.len() > RECENTLY_CLOSED_LIMIT {
                recent.pop_front();
            }
        }
        self.live.write().await.remove(&id);
    }

    async fn recent(&self, session_id: &Uuid) -> Option<SessionSnapshot> {
        self.recent
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.session_id == *session_id)
            .cloned()
    }
}

/// SessionController instance
pub struct SessionController {
    config: SessionConfig,
    registry: Arc<ChannelRegistry>,
    sources: Arc<SourceSet>,
    directory: Arc<dyn CameraDirectory>,
    table: Arc<SessionTable>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Create new SessionController
    pub fn new(
        config: SessionConfig,
        registry: Arc<ChannelRegistry>,
        sources: Arc<SourceSet>,
        directory: Arc<dyn CameraDirectory>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            registry,
            sources,
            directory,
            table: Arc::new(SessionTable::new()),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Allocate a session: new ID, reserved channel slot, Idle actor
    pub async fn create_session(&self) -> Result<Uuid> {
        let mut live = self.table.live.write().await;
        if live.len() >= self.config.max_sessions {
            return Err(Error::ResourceExhaustion(format!(
                "session limit reached ({})",
                self.config.max_sessions
            )));
        }

        let session_id = Uuid::new_v4();
        self.registry.reserve(session_id).await?;
        let closed_rx = self
            .registry
            .closed_signal(&session_id)
            .await
            .ok_or_else(|| Error::Internal("reserved slot vanished".to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(session_id));
        live.insert(
            session_id,
            SessionHandle {
                commands: command_tx,
                snapshot: snapshot_rx,
            },
        );
        drop(live);

        let actor = SessionActor::new(
            session_id,
            self.config.clone(),
            self.registry.clone(),
            self.sources.clone(),
            self.directory.clone(),
            self.table.clone(),
            self.events.clone(),
            snapshot_tx,
        );
        tokio::spawn(actor.run(command_rx, closed_rx));

        tracing::info!(session_id = %session_id, "Session created");
        Ok(session_id)
    }

    /// Start streaming; resolves once the first frame is delivered
    pub async fn start(&self, session_id: Uuid, request: StreamRequest) -> Result<SessionState> {
        request.validate()?;
        let (reply, rx) = oneshot::channel();
        self.dispatch(session_id, Command::Start { request, reply }).await?;
        rx.await
            .map_err(|_| Error::ChannelClosed(format!("session {} ended", session_id)))?
    }

    /// Restart a streaming session at a new position and/or speed
    pub async fn seek(&self, session_id: Uuid, request: SeekRequest) -> Result<SessionState> {
        request.validate()?;
        let (reply, rx) = oneshot::channel();
        self.dispatch(session_id, Command::Seek { request, reply }).await?;
        rx.await
            .map_err(|_| Error::ChannelClosed(format!("session {} ended", session_id)))?
    }

    /// Stop a session. Idempotent: unknown or finished sessions report Closed.
    pub async fn stop(&self, session_id: Uuid) -> SessionState {
        let (reply, rx) = oneshot::channel();
        if self.dispatch(session_id, Command::Stop { reply }).await.is_err() {
            return SessionState::Closed;
        }
        rx.await.unwrap_or(SessionState::Closed)
    }

    async fn dispatch(&self, session_id: Uuid, command: Command) -> Result<()> {
        let commands = {
            let live = self.table.live.read().await;
            match live.get(&session_id) {
                Some(handle) => handle.commands.clone(),
                None => {
                    return Err(match self.table.recent(&session_id).await {
                        Some(_) => Error::InvalidState(format!("session {} is closed", session_id)),
                        None => Error::UnknownSession(session_id.to_string()),
                    })
                }
            }
        };
        commands
            .send(command)
            .await
            .map_err(|_| Error::InvalidState(format!("session {} is closed", session_id)))
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<SessionSnapshot> {
        let live = self.table.live.read().await.get(session_id).map(|h| h.snapshot.borrow().clone());
        match live {
            Some(snapshot) => Some(snapshot),
            None => self.table.recent(session_id).await,
        }
    }

    pub async fn state(&self, session_id: &Uuid) -> Option<SessionState> {
        self.get(session_id).await.map(|s| s.state)
    }

    /// Snapshots of live sessions
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let live = self.table.live.read().await;
        let mut sessions: Vec<SessionSnapshot> = live.values().map(|h| h.snapshot.borrow().clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn live_count(&self) -> usize {
        self.table.live.read().await.len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop every live session (shutdown)
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.table.live.read().await.keys().copied().collect();
        let stops = ids.into_iter().map(|id| self.stop(id));
        futures::future::join_all(stops).await;
    }
}
