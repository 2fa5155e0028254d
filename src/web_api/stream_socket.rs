//! WebSocket attach for session channels
//!
//! The write half goes to the channel registry as the session's transport;
//! the read half stays here and only watches for disconnects and pongs.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::sync::watch;
use uuid::Uuid;

use crate::channel_registry::{CloseReason, Transport};
use crate::error::{Error, Result};
use crate::state::AppState;

/// Server -> client half of an upgraded socket
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
    /// Count of pongs seen by the read half
    pongs: watch::Receiver<u64>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>, pongs: watch::Receiver<u64>) -> Self {
        Self { sink, pongs }
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))
    }

    /// Resolves once the client answers; the registry bounds the wait
    async fn ping(&mut self) -> Result<()> {
        let seen = *self.pongs.borrow_and_update();
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))?;

        self.pongs
            .wait_for(|count| *count > seen)
            .await
            .map(|_| ())
            .map_err(|_| Error::ChannelClosed("socket reader gone before pong".to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: reason.close_code(),
            reason: Cow::Borrowed(reason.as_str()),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

/// Handle an upgraded stream socket for `session_id`
pub(super) async fn handle_stream_socket(socket: WebSocket, session_id: Uuid, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let (pong_tx, pong_rx) = watch::channel(0u64);

    let transport = WsTransport::new(sender, pong_rx);
    if let Err(e) = state.registry.attach(session_id, Box::new(transport)).await {
        tracing::warn!(session_id = %session_id, error = %e, "WebSocket attach rejected");
        return;
    }
    tracing::info!(session_id = %session_id, "WebSocket client attached");

    let mut closed = state.registry.closed_signal(&session_id).await;

    loop {
        tokio::select! {
            result = receiver.next() => match result {
                Some(Ok(Message::Pong(_))) => {
                    pong_tx.send_modify(|count| *count += 1);
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(session_id = %session_id, "WebSocket client disconnected");
                    state.registry.close(&session_id, CloseReason::ClientDisconnected).await;
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session_id, error = %e, "WebSocket error");
                    state.registry.close(&session_id, CloseReason::ClientDisconnected).await;
                    break;
                }
                Some(Ok(_)) => {
                    tracing::trace!(session_id = %session_id, "Ignoring inbound client message");
                }
            },
            _ = wait_closed(&mut closed) => {
                tracing::debug!(session_id = %session_id, "Channel closed by server");
                break;
            }
        }
    }
}

async fn wait_closed(closed: &mut Option<watch::Receiver<Option<CloseReason>>>) {
    if let Some(rx) = closed {
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}
