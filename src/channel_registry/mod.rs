//! ChannelRegistry - Session -> Transport Channel Map
//!
//! ## Responsibilities
//!
//! - Slot reservation per session ID, transport attach/close
//! - Best-effort, non-blocking delivery with a bounded drop-oldest queue
//! - Liveness: ping rounds and inactivity sweeps (driven by HeartbeatMonitor)
//!
//! The registry knows nothing about video. Payloads are opaque text messages.
//! Each attached channel has one writer task that owns the transport; the
//! session side only ever refers to a channel by session ID.

mod types;

pub use types::*;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

/// One registry entry
struct ChannelSlot {
    queue_tx: broadcast::Sender<String>,
    /// Held until a transport attaches so pre-attach payloads are retained
    pending_rx: Option<broadcast::Receiver<String>>,
    command_tx: Option<mpsc::Sender<WriterCommand>>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    /// Millis since registry epoch of the last successful send/ping
    last_activity: Arc<AtomicU64>,
}

/// ChannelRegistry instance
pub struct ChannelRegistry {
    slots: RwLock<HashMap<Uuid, ChannelSlot>>,
    config: RegistryConfig,
    epoch: Instant,
}

impl ChannelRegistry {
    /// Create new ChannelRegistry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Create a pending slot for a session
    pub async fn reserve(&self, session_id: Uuid) -> Result<()> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&session_id) {
            return Err(Error::DuplicateSession(session_id.to_string()));
        }

        let (queue_tx, pending_rx) = broadcast::channel(self.config.queue_capacity.max(1));
        let (closed_tx, _) = watch::channel(None);

        slots.insert(
            session_id,
            ChannelSlot {
                queue_tx,
                pending_rx: Some(pending_rx),
                command_tx: None,
                closed_tx,
                last_activity: Arc::new(AtomicU64::new(self.now_ms())),
            },
        );

        tracing::debug!(session_id = %session_id, "Channel slot reserved");
        Ok(())
    }

    /// Bind a transport to a reserved slot
    ///
    /// Payloads queued before attach are flushed first, oldest first.
    pub async fn attach(self: &Arc<Self>, session_id: Uuid, transport: Box<dyn Transport>) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(&session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        let queue_rx = slot.pending_rx.take().ok_or_else(|| {
            Error::DuplicateSession(format!("{}: transport already attached", session_id))
        })?;

        let (command_tx, command_rx) = mpsc::channel(4);
        slot.command_tx = Some(command_tx);
        slot.last_activity.store(self.now_ms(), Ordering::Relaxed);

        let closed_rx = slot.closed_tx.subscribe();
        let activity = slot.last_activity.clone();
        let registry = self.clone();

        tokio::spawn(async move {
            registry
                .run_writer(session_id, queue_rx, command_rx, closed_rx, transport, activity)
                .await;
        });

        tracing::info!(session_id = %session_id, "Transport attached");
        Ok(())
    }

    /// Best-effort, non-blocking delivery
    ///
    /// A full queue drops its oldest item. Returns ChannelClosed when no
    /// live channel exists for the session.
    pub async fn send(&self, session_id: &Uuid, payload: String) -> Result<()> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(session_id)
            .ok_or_else(|| Error::ChannelClosed(session_id.to_string()))?;

        slot.queue_tx
            .send(payload)
            .map(|_| ())
            .map_err(|_| Error::ChannelClosed(session_id.to_string()))
    }

    /// Release the transport and remove the slot. Idempotent.
    ///
    /// Returns true if this call removed the slot.
    pub async fn close(&self, session_id: &Uuid, reason: CloseReason) -> bool {
        let removed = self.slots.write().await.remove(session_id);
        match removed {
            Some(slot) => {
                slot.closed_tx.send_replace(Some(reason));
                tracing::info!(
                    session_id = %session_id,
                    reason = reason.as_str(),
                    "Channel closed"
                );
                true
            }
            None => false,
        }
    }

    /// Watch for the slot's closure
    ///
    /// The value turns `Some(reason)` once; the sender is dropped right after.
    pub async fn closed_signal(&self, session_id: &Uuid) -> Option<watch::Receiver<Option<CloseReason>>> {
        let slots = self.slots.read().await;
        slots.get(session_id).map(|slot| slot.closed_tx.subscribe())
    }

    pub async fn contains(&self, session_id: &Uuid) -> bool {
        self.slots.read().await.contains_key(session_id)
    }

    pub async fn is_attached(&self, session_id: &Uuid) -> bool {
        self.slots
            .read()
            .await
            .get(session_id)
            .map(|slot| slot.command_tx.is_some())
            .unwrap_or(false)
    }

    /// Open slot count
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn info(&self, session_id: &Uuid) -> Option<ChannelInfo> {
        let now = self.now_ms();
        let slots = self.slots.read().await;
        slots.get(session_id).map(|slot| ChannelInfo {
            session_id: *session_id,
            attached: slot.command_tx.is_some(),
            idle_ms: now.saturating_sub(slot.last_activity.load(Ordering::Relaxed)),
        })
    }

    /// Ping every attached channel; failures are closed immediately
    ///
    /// Pings run concurrently so one stalled channel never delays another.
    /// Returns the number of channels closed.
    pub async fn ping_all(&self) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<WriterCommand>)> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter_map(|(id, slot)| slot.command_tx.clone().map(|tx| (*id, tx)))
                .collect()
        };

        if targets.is_empty() {
            return 0;
        }

        let ping_timeout = self.config.ping_timeout;
        let rounds = targets.into_iter().map(|(id, tx)| async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(WriterCommand::Ping(reply_tx)).await.is_err() {
                return (id, false);
            }
            let ok = matches!(timeout(ping_timeout, reply_rx).await, Ok(Ok(true)));
            (id, ok)
        });

        let results = futures::future::join_all(rounds).await;

        let mut closed = 0;
        for (id, ok) in results {
            if !ok {
                tracing::warn!(session_id = %id, "Heartbeat ping failed");
                if self.close(&id, CloseReason::PingFailed).await {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Close slots with no successful send/ping within the inactivity window
    ///
    /// Reserved-but-unattached slots age from their reservation.
    pub async fn sweep_inactive(&self) -> Vec<Uuid> {
        let now = self.now_ms();
        let limit = self.config.inactivity_timeout.as_millis() as u64;

        let expired: Vec<Uuid> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter(|(_, slot)| now.saturating_sub(slot.last_activity.load(Ordering::Relaxed)) > limit)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut closed = Vec::with_capacity(expired.len());
        for id in expired {
            if self.close(&id, CloseReason::Inactive).await {
                closed.push(id);
            }
        }
        closed
    }

    /// Writer task: sole owner of the attached transport
    async fn run_writer(
        self: Arc<Self>,
        session_id: Uuid,
        mut queue_rx: broadcast::Receiver<String>,
        mut command_rx: mpsc::Receiver<WriterCommand>,
        mut closed_rx: watch::Receiver<Option<CloseReason>>,
        mut transport: Box<dyn Transport>,
        activity: Arc<AtomicU64>,
    ) {
        let io_timeout = self.config.ping_timeout;

        let failure = loop {
            tokio::select! {
                biased;
                changed = closed_rx.changed() => {
                    let current = *closed_rx.borrow();
                    let reason = match changed {
                        Ok(()) => current.unwrap_or(CloseReason::SessionEnded),
                        Err(_) => CloseReason::SessionEnded,
                    };
                    transport.close(reason).await;
                    break None;
                }
                Some(command) = command_rx.recv() => match command {
                    WriterCommand::Ping(reply) => {
                        let ok = matches!(timeout(io_timeout, transport.ping()).await, Ok(Ok(())));
                        if ok {
                            activity.store(self.now_ms(), Ordering::Relaxed);
                        }
                        let _ = reply.send(ok);
                        if !ok {
                            break Some(CloseReason::PingFailed);
                        }
                    }
                },
                received = queue_rx.recv() => match received {
                    Ok(text) => match timeout(io_timeout, transport.send_text(text)).await {
                        Ok(Ok(())) => activity.store(self.now_ms(), Ordering::Relaxed),
                        Ok(Err(e)) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Channel send failed");
                            break Some(CloseReason::SendFailed);
                        }
                        Err(_) => {
                            tracing::warn!(session_id = %session_id, "Channel send timed out");
                            break Some(CloseReason::SendFailed);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::debug!(session_id = %session_id, dropped = dropped, "Outbound queue full, dropped oldest");
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                },
            }
        };

        if let Some(reason) = failure {
            self.close(&session_id, reason).await;
            transport.close(reason).await;
        }

        tracing::debug!(session_id = %session_id, "Channel writer finished");
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Test transports shared by module tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Records everything written; failures can be switched on
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<String>>>,
        pub closed: Arc<Mutex<Option<CloseReason>>>,
        pub pings: Arc<AtomicU64>,
        pub fail_send: Arc<AtomicBool>,
        pub fail_ping: Arc<AtomicBool>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub fn closed_with(&self) -> Option<CloseReason> {
            *self.closed.lock().unwrap()
        }

        pub fn boxed(&self) -> Box<dyn Transport> {
            Box::new(self.clone())
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_text(&mut self, text: String) -> Result<()> {
            if self.fail_send.load(Ordering::Relaxed) {
                return Err(Error::ChannelClosed("broken pipe".to_string()));
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn ping(&mut self) -> Result<()> {
            if self.fail_ping.load(Ordering::Relaxed) {
                return Err(Error::ChannelClosed("ping failed".to_string()));
            }
            self.pings.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn close(&mut self, reason: CloseReason) {
            let mut closed = self.closed.lock().unwrap();
            if closed.is_none() {
                *closed = Some(reason);
            }
        }
    }

    /// Poll until `cond` holds or give up after ~2s of (possibly paused) time
    pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        cond()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;

    fn registry(capacity: usize) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry::new(RegistryConfig {
            queue_capacity: capacity,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_reserve_duplicate_rejected() {
        let registry = registry(8);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        let result = registry.reserve(id).await;
        assert!(matches!(result, Err(Error::DuplicateSession(_))));
    }

    #[tokio::test]
    async fn test_info_tracks_attach_and_close() {
        let registry = registry(8);
        assert!(registry.is_empty().await);

        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        let info = registry.info(&id).await.unwrap();
        assert!(!info.attached);
        assert_eq!(info.session_id, id);

        registry.attach(id, RecordingTransport::new().boxed()).await.unwrap();
        assert!(registry.info(&id).await.unwrap().attached);
        assert!(!registry.is_empty().await);

        registry.close(&id, CloseReason::SessionEnded).await;
        assert!(registry.info(&id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let registry = registry(8);
        let transport = RecordingTransport::new();
        let result = registry.attach(Uuid::new_v4(), transport.boxed()).await;
        assert!(matches!(result, Err(Error::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_second_attach_rejected() {
        let registry = registry(8);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        registry.attach(id, RecordingTransport::new().boxed()).await.unwrap();
        let result = registry.attach(id, RecordingTransport::new().boxed()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_to_absent_session_is_channel_closed() {
        let registry = registry(8);
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            registry.send(&Uuid::new_v4(), "x".to_string()),
        )
        .await
        .expect("send must not block");
        assert!(matches!(result, Err(Error::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_pre_attach_queue_keeps_newest() {
        let registry = registry(4);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();

        for i in 0..10 {
            registry.send(&id, format!("f{}", i)).await.unwrap();
        }

        let transport = RecordingTransport::new();
        registry.attach(id, transport.boxed()).await.unwrap();

        assert!(wait_until(|| transport.sent().len() == 4).await);
        assert_eq!(transport.sent(), vec!["f6", "f7", "f8", "f9"]);
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let registry = registry(256);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        let transport = RecordingTransport::new();
        registry.attach(id, transport.boxed()).await.unwrap();

        for i in 0..100 {
            registry.send(&id, i.to_string()).await.unwrap();
        }

        assert!(wait_until(|| transport.sent().len() == 100).await);
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(transport.sent(), expected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = registry(8);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        let transport = RecordingTransport::new();
        registry.attach(id, transport.boxed()).await.unwrap();

        assert!(registry.close(&id, CloseReason::SessionEnded).await);
        assert!(!registry.close(&id, CloseReason::SessionEnded).await);
        assert!(!registry.contains(&id).await);
        assert!(wait_until(|| transport.closed_with() == Some(CloseReason::SessionEnded)).await);

        let result = registry.send(&id, "late".to_string()).await;
        assert!(matches!(result, Err(Error::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_send_failure_closes_channel() {
        let registry = registry(8);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        let mut closed = registry.closed_signal(&id).await.unwrap();

        let transport = RecordingTransport::new();
        transport.fail_send.store(true, Ordering::Relaxed);
        registry.attach(id, transport.boxed()).await.unwrap();

        registry.send(&id, "frame".to_string()).await.unwrap();

        let reason = closed.wait_for(|r| r.is_some()).await.map(|r| *r).ok().flatten();
        assert_eq!(reason, Some(CloseReason::SendFailed));
        assert!(!registry.contains(&id).await);
    }

    #[tokio::test]
    async fn test_ping_failure_closes_only_that_channel() {
        let registry = registry(8);
        let healthy_id = Uuid::new_v4();
        let broken_id = Uuid::new_v4();
        registry.reserve(healthy_id).await.unwrap();
        registry.reserve(broken_id).await.unwrap();

        let healthy = RecordingTransport::new();
        let broken = RecordingTransport::new();
        broken.fail_ping.store(true, Ordering::Relaxed);
        registry.attach(healthy_id, healthy.boxed()).await.unwrap();
        registry.attach(broken_id, broken.boxed()).await.unwrap();

        let closed = registry.ping_all().await;
        assert_eq!(closed, 1);
        assert!(registry.contains(&healthy_id).await);
        assert!(!registry.contains(&broken_id).await);
        assert_eq!(healthy.pings.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_inactive_slots() {
        let registry = registry(8);
        let stale = Uuid::new_v4();
        registry.reserve(stale).await.unwrap();
        let mut closed = registry.closed_signal(&stale).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        let fresh = Uuid::new_v4();
        registry.reserve(fresh).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let swept = registry.sweep_inactive().await;

        assert_eq!(swept, vec![stale]);
        assert!(registry.contains(&fresh).await);
        assert_eq!(*closed.borrow_and_update(), Some(CloseReason::Inactive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_send_refreshes_activity() {
        let registry = registry(8);
        let id = Uuid::new_v4();
        registry.reserve(id).await.unwrap();
        let transport = RecordingTransport::new();
        registry.attach(id, transport.boxed()).await.unwrap();

        tokio::time::advance(Duration::from_secs(25)).await;
        registry.send(&id, "keepalive".to_string()).await.unwrap();
        assert!(wait_until(|| transport.sent().len() == 1).await);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.sweep_inactive().await.is_empty());
        assert!(registry.contains(&id).await);
    }
}
