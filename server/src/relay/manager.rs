//! Relay manager — owns every relay connection and the cube routing table.
//!
//! DESIGN
//! ======
//! `cube_to_relay` is built from config at startup and never mutated, so
//! command routing needs no lock. Connection drivers report status changes
//! and inbound documents on one channel; a single pump task consumes it,
//! which keeps per-relay ingest in arrival order all the way into the
//! registry. Digested results leave on the `RelayEvent` channel for the
//! gateway, so the manager never calls UI code directly.
//!
//! ERROR HANDLING
//! ==============
//! Command fan-out validates each target and stops at the first failure;
//! commands already handed to a relay are not rolled back. A relay outage
//! never touches registry or orchestrator state, only future commands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::ControlServerConfig;
use crate::envelope::now_ms;
use crate::registry::{CubeRegistry, CubeState, CubeUpdate, LedColor};
use crate::relay::connection::{
    ConnectionEvent, ConnectionOptions, ConnectionState, RelayConnection,
};
use crate::relay::protocol::{self, RelayMessage};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("{command} requires at least one target")]
    NoTargets { command: &'static str },
    #[error("cube {0} is not registered")]
    UnknownCube(String),
    #[error("relay {0} is not connected")]
    NotConnected(String),
}

/// Status of one relay link as shown to UI clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatusEvent {
    pub relay_id: String,
    pub status: String,
    pub message: String,
}

/// Digested relay activity, consumed by the gateway.
#[derive(Debug)]
pub enum RelayEvent {
    Status(RelayStatusEvent),
    CubeUpdates(Vec<CubeState>),
    Log {
        level: String,
        message: String,
        context: Value,
    },
}

struct RelayHandle {
    cubes: Vec<String>,
    connection: RelayConnection,
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct RelayManager {
    registry: Arc<CubeRegistry>,
    relays: HashMap<String, RelayHandle>,
    cube_to_relay: HashMap<String, String>,
    states: Mutex<HashMap<String, ConnectionState>>,
    events: mpsc::UnboundedSender<RelayEvent>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl RelayManager {
    #[must_use]
    pub fn new(
        registry: Arc<CubeRegistry>,
        config: &ControlServerConfig,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();

        let mut relays = HashMap::new();
        let mut cube_to_relay = HashMap::new();
        let mut states = HashMap::new();
        for relay in &config.relays {
            let connection = RelayConnection::new(ConnectionOptions {
                relay_id: relay.id.clone(),
                uri: relay.uri.clone(),
                reconnect_delay: config.relay_reconnect,
            });
            relays.insert(relay.id.clone(), RelayHandle { cubes: relay.cubes.clone(), connection });
            states.insert(relay.id.clone(), ConnectionState::Stopped);
            for cube in &relay.cubes {
                cube_to_relay.insert(cube.clone(), relay.id.clone());
            }
        }

        Self {
            registry,
            relays,
            cube_to_relay,
            states: Mutex::new(states),
            events,
            connection_tx,
            connection_rx: Mutex::new(Some(connection_rx)),
        }
    }

    /// Start every connection and the event pump.
    pub fn start(self: &Arc<Self>) {
        if let Some(mut rx) = self.connection_rx.lock().unwrap().take() {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    manager.handle_connection_event(event);
                }
            });
        }
        for handle in self.relays.values() {
            handle.connection.start(self.connection_tx.clone());
        }
    }

    /// Tear down every connection. Queued relay traffic is discarded.
    pub fn stop(&self) {
        for handle in self.relays.values() {
            handle.connection.stop();
        }
    }

    /// The relay owning `cube_id`, if configured.
    #[must_use]
    pub fn relay_for_cube(&self, cube_id: &str) -> Option<&str> {
        self.cube_to_relay.get(cube_id).map(String::as_str)
    }

    // =========================================================================
    // COMMAND FAN-OUT
    // =========================================================================

    /// Send a drive command to every target, one relay envelope per cube.
    pub fn send_manual_drive(
        &self,
        targets: &[String],
        left: i64,
        right: i64,
    ) -> Result<(), RelayError> {
        if targets.is_empty() {
            return Err(RelayError::NoTargets { command: "manual_drive" });
        }
        for target in targets {
            self.send_to_cube(target, &protocol::move_command(target, left, right))?;
        }
        Ok(())
    }

    /// Send an LED command to every target.
    pub fn send_led(&self, targets: &[String], color: LedColor) -> Result<(), RelayError> {
        if targets.is_empty() {
            return Err(RelayError::NoTargets { command: "set_led" });
        }
        for target in targets {
            self.send_to_cube(target, &protocol::led_command(target, color))?;
        }
        Ok(())
    }

    fn send_to_cube(&self, cube_id: &str, message: &Value) -> Result<(), RelayError> {
        let relay_id = self
            .cube_to_relay
            .get(cube_id)
            .ok_or_else(|| RelayError::UnknownCube(cube_id.to_string()))?;
        let handle = self
            .relays
            .get(relay_id)
            .ok_or_else(|| RelayError::NotConnected(relay_id.clone()))?;
        if self.relay_state(relay_id) != ConnectionState::Connected {
            return Err(RelayError::NotConnected(relay_id.clone()));
        }
        handle.connection.send(message);
        Ok(())
    }

    fn relay_state(&self, relay_id: &str) -> ConnectionState {
        self.states
            .lock()
            .unwrap()
            .get(relay_id)
            .copied()
            .unwrap_or(ConnectionState::Stopped)
    }

    // =========================================================================
    // INGEST
    // =========================================================================

    pub(crate) fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Status { relay_id, state, message } => {
                self.handle_status(&relay_id, state, &message);
            }
            ConnectionEvent::Message { relay_id, message } => {
                self.handle_message(&relay_id, &message);
            }
        }
    }

    fn handle_status(&self, relay_id: &str, state: ConnectionState, message: &str) {
        self.states.lock().unwrap().insert(relay_id.to_string(), state);
        let _ = self.events.send(RelayEvent::Status(RelayStatusEvent {
            relay_id: relay_id.to_string(),
            status: state.as_str().to_string(),
            message: message.to_string(),
        }));

        if state == ConnectionState::Connected {
            self.bootstrap(relay_id);
        }
    }

    /// Re-establish device state for every cube behind a freshly connected
    /// relay: BLE connect, position subscription, battery one-shot, in order.
    fn bootstrap(&self, relay_id: &str) {
        let Some(handle) = self.relays.get(relay_id) else {
            return;
        };
        for cube in &handle.cubes {
            for message in protocol::bootstrap_sequence(cube) {
                handle.connection.send(&message);
            }
        }
        info!(%relay_id, cubes = handle.cubes.len(), "bootstrapped relay");
    }

    fn handle_message(&self, relay_id: &str, message: &Value) {
        match protocol::parse_message(message) {
            RelayMessage::Position { target, position, led } => {
                let update = CubeUpdate {
                    cube_id: target,
                    relay_id: Some(relay_id.to_string()),
                    timestamp: now_ms(),
                    position,
                    led,
                    ..CubeUpdate::default()
                };
                self.apply_and_publish(&[update]);
            }
            RelayMessage::Battery { target, level } => {
                let update = CubeUpdate {
                    cube_id: target,
                    relay_id: Some(relay_id.to_string()),
                    timestamp: now_ms(),
                    battery: level,
                    ..CubeUpdate::default()
                };
                self.apply_and_publish(&[update]);
            }
            RelayMessage::System(payload) => {
                info!(%relay_id, "relay system message");
                let _ = self.events.send(RelayEvent::Log {
                    level: "info".into(),
                    message: "relay system message".into(),
                    context: json!({ "relay_id": relay_id, "message": payload }),
                });
            }
            RelayMessage::Error(text) => {
                error!(%relay_id, message = %text, "relay error");
                let _ = self.events.send(RelayEvent::Log {
                    level: "error".into(),
                    message: text,
                    context: json!({ "relay_id": relay_id }),
                });
            }
            RelayMessage::Ignored => {}
        }
    }

    fn apply_and_publish(&self, updates: &[CubeUpdate]) {
        let changed = self.registry.apply_updates(updates);
        if !changed.is_empty() {
            let _ = self.events.send(RelayEvent::CubeUpdates(changed));
        }
    }

    // =========================================================================
    // TEST SEAMS
    // =========================================================================

    /// Mark a relay Connected and expose its outbound queue, standing in for
    /// a live socket.
    #[cfg(test)]
    pub(crate) fn connect_for_tests(&self, relay_id: &str) -> mpsc::UnboundedReceiver<String> {
        let rx = self.relays[relay_id].connection.install_outbound_for_tests();
        self.states
            .lock()
            .unwrap()
            .insert(relay_id.to_string(), ConnectionState::Connected);
        rx
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
