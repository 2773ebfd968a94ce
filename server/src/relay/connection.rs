//! One resilient WebSocket client to one relay.
//!
//! DESIGN
//! ======
//! Each connection runs a single driver task that owns the socket, so state
//! transitions, reads, and writes never race. The driver cycles
//! Stopped -> Connecting -> Connected -> Stopped until `stop()`, waiting
//! `reconnect_delay` between attempts. Status changes and inbound documents
//! are reported to the manager over an event channel.
//!
//! Outbound messages are enqueued only while Connected; anything sent while
//! down is dropped silently because the manager re-bootstraps the relay's
//! cubes on the next connect. The queue itself is discarded on disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::config::RelayUri;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Raised by a connection driver toward the manager.
#[derive(Debug)]
pub enum ConnectionEvent {
    Status {
        relay_id: String,
        state: ConnectionState,
        message: String,
    },
    Message {
        relay_id: String,
        message: Value,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub relay_id: String,
    pub uri: RelayUri,
    pub reconnect_delay: Duration,
}

// =============================================================================
// CONNECTION
// =============================================================================

pub struct RelayConnection {
    options: ConnectionOptions,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    stopping: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    #[must_use]
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            outbound: Arc::new(Mutex::new(None)),
            stopping: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
        }
    }

    /// Spawn the driver task. Idempotent: a live driver is left alone.
    pub fn start(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let mut driver = self.driver.lock().unwrap();
        if driver.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        let options = self.options.clone();
        let outbound = Arc::clone(&self.outbound);
        let stopping = Arc::clone(&self.stopping);
        *driver = Some(tokio::spawn(drive(options, outbound, stopping, events)));
    }

    /// Abort the driver, discard the outbound queue, cancel the reconnect
    /// timer. No graceful drain.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(task) = self.driver.lock().unwrap().take() {
            task.abort();
        }
        self.outbound.lock().unwrap().take();
    }

    /// Enqueue one document for the relay. Dropped silently while not
    /// Connected.
    pub fn send(&self, message: &Value) {
        let outbound = self.outbound.lock().unwrap();
        if let Some(tx) = outbound.as_ref() {
            let _ = tx.send(message.to_string());
        }
    }

    /// Install an outbound queue without a socket, so tests can observe what
    /// the manager would have written to the wire.
    #[cfg(test)]
    pub(crate) fn install_outbound_for_tests(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap() = Some(tx);
        rx
    }
}

// =============================================================================
// DRIVER
// =============================================================================

async fn drive(
    options: ConnectionOptions,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    stopping: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let relay_id = options.relay_id.clone();
    let url = options.uri.url();

    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        emit_status(&events, &relay_id, ConnectionState::Connecting, "resolving");

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!(%relay_id, %url, "relay connected");
                emit_status(&events, &relay_id, ConnectionState::Connected, "connected");

                let (tx, rx) = mpsc::unbounded_channel();
                *outbound.lock().unwrap() = Some(tx);
                let reason = run_connected(stream, rx, &relay_id, &events).await;
                outbound.lock().unwrap().take();

                emit_status(&events, &relay_id, ConnectionState::Stopped, reason);
            }
            Err(error) => {
                warn!(%relay_id, %url, %error, "relay connect failed");
                emit_status(&events, &relay_id, ConnectionState::Stopped, "connect error");
            }
        }

        if stopping.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(options.reconnect_delay).await;
    }
}

/// Pump the socket until it fails. Returns the status tag for the failure.
async fn run_connected(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut queue: mpsc::UnboundedReceiver<String>,
    relay_id: &str,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> &'static str {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            queued = queue.recv() => {
                // The sender half lives until this function returns, so recv
                // only yields real messages.
                let Some(text) = queued else { return "closed" };
                if let Err(error) = sink.send(Message::Text(text.into())).await {
                    warn!(%relay_id, %error, "relay write failed");
                    return "write error";
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(message) => {
                            let _ = events.send(ConnectionEvent::Message {
                                relay_id: relay_id.to_string(),
                                message,
                            });
                        }
                        // One bad document never tears the connection down.
                        Err(error) => warn!(%relay_id, %error, "failed to parse relay JSON"),
                    },
                    Some(Ok(Message::Close(_))) | None => return "closed by remote",
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%relay_id, %error, "relay read failed");
                        return "read error";
                    }
                }
            }
        }
    }
}

fn emit_status(
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    relay_id: &str,
    state: ConnectionState,
    message: &str,
) {
    let _ = events.send(ConnectionEvent::Status {
        relay_id: relay_id.to_string(),
        state,
        message: message.to_string(),
    });
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
