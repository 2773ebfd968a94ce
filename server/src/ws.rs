//! UI WebSocket server — acceptor, session table, outbound fan-out plumbing.
//!
//! DESIGN
//! ======
//! The axum router's fallback performs the upgrade, so sessions may connect
//! on any request path. Each accepted socket runs one task that multiplexes
//! the inbound stream with a per-session outbound queue, which serializes all
//! socket operations for that session. Inbound text frames are parsed to JSON
//! and handed to the gateway; parse failures are logged and skipped.
//!
//! Outbound queues are bounded. A session that cannot drain 256 pending
//! messages is having its traffic dropped with a warning rather than growing
//! memory without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::envelope::Envelope;
use crate::gateway::Gateway;

/// Outbound messages buffered per session before drops kick in.
const SESSION_QUEUE_CAP: usize = 256;

pub type SessionId = u64;

// =============================================================================
// SESSION TABLE
// =============================================================================

#[derive(Default)]
pub struct WsServer {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<String>>>,
    next_session_id: AtomicU64,
}

impl WsServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id and its outbound queue.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<String>) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAP);
        self.sessions.write().unwrap().insert(session_id, tx);
        (session_id, rx)
    }

    pub fn unregister(&self, session_id: SessionId) {
        self.sessions.write().unwrap().remove(&session_id);
    }

    /// Enqueue an envelope for one session. Unknown ids are a no-op.
    pub fn send(&self, session_id: SessionId, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(text) => self.send_text(session_id, text),
            Err(error) => warn!(session_id, %error, "failed to serialize envelope"),
        }
    }

    /// Enqueue an envelope for every session.
    pub fn broadcast(&self, envelope: &Envelope) {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "failed to serialize envelope");
                return;
            }
        };
        let session_ids: Vec<SessionId> =
            self.sessions.read().unwrap().keys().copied().collect();
        for session_id in session_ids {
            self.send_text(session_id, text.clone());
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    fn send_text(&self, session_id: SessionId, text: String) {
        let sessions = self.sessions.read().unwrap();
        let Some(tx) = sessions.get(&session_id) else {
            return;
        };
        match tx.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id, "session outbound queue full; dropping message");
            }
            // Session task already exited; unregister will follow.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

// =============================================================================
// ACCEPTOR
// =============================================================================

/// Serve UI sessions on `listener` until SIGINT.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> std::io::Result<()> {
    let app = Router::new().fallback(upgrade).with_state(gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn upgrade(State(gateway): State<Arc<Gateway>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_session(gateway, socket))
}

async fn run_session(gateway: Arc<Gateway>, mut socket: WebSocket) {
    let (session_id, mut outbound) = gateway.ws().register();
    info!(session_id, "ui session connected");
    gateway.handle_open(session_id);

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else { break };
                match message {
                    Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => gateway.handle_message(&value, session_id),
                        Err(error) => {
                            warn!(session_id, %error, "received invalid JSON");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            queued = outbound.recv() => {
                let Some(text) = queued else { break };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    gateway.ws().unregister(session_id);
    gateway.handle_close(session_id);
    info!(session_id, "ui session closed");
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
