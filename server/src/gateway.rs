//! Command gateway — the UI-facing brain of the server.
//!
//! ARCHITECTURE
//! ============
//! Sits above `WsServer`. Inbound commands are validated, dispatched by
//! `type`, and answered with `ack`/`error` envelopes. Relay activity arrives
//! as `RelayEvent`s and is fanned out to sessions through per-session
//! subscription filters. The gateway also keeps the last status per relay and
//! the group alias map.
//!
//! ORDERING
//! ========
//! A handler enqueues its `ack` before publishing any event the command
//! caused, in the same task that mutates state, so a session always sees the
//! reply before the consequences.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::warn;

use crate::config::FieldConfig;
use crate::envelope::{
    now_ms, Command, Envelope, GatewayError, DEFAULT_STREAMS, EVENT_FIELD_INFO, EVENT_SNAPSHOT,
    STREAM_CUBE_UPDATE, STREAM_FLEET_STATE, STREAM_LOG, STREAM_RELAY_STATUS,
};
use crate::fleet::{FleetOrchestrator, FleetState, GoalPose, GoalRequest};
use crate::registry::{CubeRegistry, CubeState, CubeUpdate, LedColor};
use crate::relay::manager::{RelayEvent, RelayManager, RelayStatusEvent};
use crate::ws::{SessionId, WsServer};

/// History entries included in a snapshot when a client asks for them.
const SNAPSHOT_HISTORY: usize = 64;

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// A session's filter over event streams and cubes. Empty cube filter means
/// all cubes; empty stream set means all streams.
#[derive(Debug, Clone)]
struct Subscription {
    streams: HashSet<String>,
    cube_filter: HashSet<String>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            streams: DEFAULT_STREAMS.iter().map(|s| (*s).to_string()).collect(),
            cube_filter: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct GatewayInner {
    subscriptions: HashMap<SessionId, Subscription>,
    relay_status: BTreeMap<String, RelayStatusEvent>,
    groups: HashMap<String, Vec<String>>,
}

// =============================================================================
// GATEWAY
// =============================================================================

pub struct Gateway {
    ws: Arc<WsServer>,
    relays: Arc<RelayManager>,
    registry: Arc<CubeRegistry>,
    fleet: Arc<FleetOrchestrator>,
    field: FieldConfig,
    inner: Mutex<GatewayInner>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        ws: Arc<WsServer>,
        relays: Arc<RelayManager>,
        registry: Arc<CubeRegistry>,
        fleet: Arc<FleetOrchestrator>,
        field: FieldConfig,
    ) -> Self {
        Self { ws, relays, registry, fleet, field, inner: Mutex::new(GatewayInner::default()) }
    }

    #[must_use]
    pub fn ws(&self) -> &Arc<WsServer> {
        &self.ws
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    pub fn handle_open(&self, session_id: SessionId) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(session_id, Subscription::default());
        self.send_snapshot(session_id, false);
    }

    pub fn handle_close(&self, session_id: SessionId) {
        self.inner.lock().unwrap().subscriptions.remove(&session_id);
    }

    // =========================================================================
    // COMMAND DISPATCH
    // =========================================================================

    pub fn handle_message(&self, message: &Value, session_id: SessionId) {
        let command = match Command::parse(message) {
            Ok(command) => command,
            Err(error) => {
                self.ws.send(session_id, &Envelope::error("", &error));
                return;
            }
        };

        let result = match command.kind.as_str() {
            "subscribe" => self.handle_subscribe(&command, session_id),
            "manual_drive" => self.handle_manual_drive(&command, session_id),
            "set_led" => self.handle_set_led(&command, session_id),
            "set_goal" => self.handle_set_goal(&command, session_id),
            "set_group" => self.handle_set_group(&command, session_id),
            "request_snapshot" => self.handle_request_snapshot(&command, session_id),
            other => Err(GatewayError::InvalidPayload(format!("unknown command type: {other}"))),
        };

        if let Err(error) = result {
            warn!(session_id, kind = %command.kind, code = error.code(), %error, "command rejected");
            self.ws.send(session_id, &Envelope::error(&command.request_id, &error));
        }
    }

    fn handle_subscribe(&self, command: &Command, session_id: SessionId) -> Result<(), GatewayError> {
        let payload = &command.payload;
        let mut subscription = Subscription::default();

        if let Some(streams) = payload.get("streams").and_then(Value::as_array) {
            let streams: HashSet<String> = streams
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            // An explicitly empty list falls back to the default set.
            if !streams.is_empty() {
                subscription.streams = streams;
            }
        }
        if let Some(filter) = payload.get("cube_filter").and_then(Value::as_array) {
            subscription.cube_filter = filter
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        let include_history = payload
            .get("include_history")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.inner.lock().unwrap().subscriptions.insert(session_id, subscription);

        self.ws.send(session_id, &Envelope::ack(&command.request_id, None));
        self.send_field_info(session_id);
        if include_history {
            self.send_snapshot(session_id, true);
        }
        Ok(())
    }

    fn handle_manual_drive(
        &self,
        command: &Command,
        session_id: SessionId,
    ) -> Result<(), GatewayError> {
        let targets = self.expand_targets(parse_targets(&command.payload, "manual_drive")?);
        let left = command.payload.get("left").and_then(Value::as_i64).unwrap_or(0);
        let right = command.payload.get("right").and_then(Value::as_i64).unwrap_or(0);

        self.relays.send_manual_drive(&targets, left, right)?;
        self.ws.send(session_id, &Envelope::ack(&command.request_id, None));
        Ok(())
    }

    fn handle_set_led(&self, command: &Command, session_id: SessionId) -> Result<(), GatewayError> {
        let targets = self.expand_targets(parse_targets(&command.payload, "set_led")?);
        let color = command.payload.get("color").cloned().unwrap_or_else(|| json!({}));
        if !color.is_object() {
            return Err(GatewayError::InvalidPayload("color must be object".into()));
        }
        let color = LedColor {
            r: color_channel(&color, "r"),
            g: color_channel(&color, "g"),
            b: color_channel(&color, "b"),
        };

        self.relays.send_led(&targets, color)?;
        self.ws.send(session_id, &Envelope::ack(&command.request_id, None));

        // Reflect the commanded color in the registry so snapshots and the
        // cube_update stream agree with what went over the wire.
        let timestamp = now_ms();
        let updates: Vec<CubeUpdate> = targets
            .iter()
            .map(|cube_id| CubeUpdate {
                cube_id: cube_id.clone(),
                timestamp,
                led: Some(color.into()),
                ..CubeUpdate::default()
            })
            .collect();
        let changed = self.registry.apply_updates(&updates);
        self.publish_cube_updates(&changed);
        Ok(())
    }

    fn handle_set_goal(&self, command: &Command, session_id: SessionId) -> Result<(), GatewayError> {
        let payload = &command.payload;
        let raw_targets = payload
            .get("targets")
            .and_then(Value::as_array)
            .filter(|targets| !targets.is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidPayload("set_goal.targets must be non-empty array".into())
            })?;
        let targets = self.expand_targets(
            raw_targets
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        );

        let goal = payload
            .get("goal")
            .filter(|goal| goal.is_object())
            .ok_or_else(|| GatewayError::InvalidPayload("goal must be object".into()))?;
        let pose = GoalPose {
            x: goal.get("x").and_then(Value::as_f64).unwrap_or(0.0),
            y: goal.get("y").and_then(Value::as_f64).unwrap_or(0.0),
            angle: goal.get("angle").and_then(Value::as_f64),
        };
        let request = GoalRequest {
            targets: targets.clone(),
            pose,
            priority: payload.get("priority").and_then(Value::as_i64).unwrap_or(0),
            keep_history: payload
                .get("keep_history")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let goal_id = self.fleet.assign_goal(&request)?;
        self.ws.send(
            session_id,
            &Envelope::ack(&command.request_id, Some(json!({ "goal_id": goal_id }))),
        );

        // Record the assignment on each cube before broadcasting fleet state,
        // so no fleet_state ever mentions a goal the registry has not seen.
        let timestamp = now_ms();
        let updates: Vec<CubeUpdate> = targets
            .iter()
            .map(|cube_id| CubeUpdate {
                cube_id: cube_id.clone(),
                timestamp,
                goal_id: Some(goal_id.clone()),
                ..CubeUpdate::default()
            })
            .collect();
        let changed = self.registry.apply_updates(&updates);
        self.publish_cube_updates(&changed);
        self.publish_fleet_state();
        Ok(())
    }

    fn handle_set_group(&self, command: &Command, session_id: SessionId) -> Result<(), GatewayError> {
        let payload = &command.payload;
        let group_id = payload
            .get("group_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::InvalidPayload("group_id is required".into()))?;
        let members = payload
            .get("members")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::InvalidPayload("members must be array".into()))?;
        let members: Vec<String> = members
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        self.inner.lock().unwrap().groups.insert(group_id.to_string(), members);
        self.ws.send(session_id, &Envelope::ack(&command.request_id, None));
        Ok(())
    }

    fn handle_request_snapshot(
        &self,
        command: &Command,
        session_id: SessionId,
    ) -> Result<(), GatewayError> {
        let include_history = command
            .payload
            .get("include_history")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.ws.send(session_id, &Envelope::ack(&command.request_id, None));
        self.send_snapshot(session_id, include_history);
        Ok(())
    }

    /// Replace group ids in a target list with their members, deduplicated
    /// and order-preserving. Unknown names pass through as cube ids.
    fn expand_targets(&self, targets: Vec<String>) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut expanded = Vec::new();
        for target in targets {
            match inner.groups.get(&target) {
                Some(members) => {
                    for member in members {
                        if seen.insert(member.clone()) {
                            expanded.push(member.clone());
                        }
                    }
                }
                None => {
                    if seen.insert(target.clone()) {
                        expanded.push(target);
                    }
                }
            }
        }
        expanded
    }

    // =========================================================================
    // EVENT PUBLICATION
    // =========================================================================

    /// Entry point for digested relay activity.
    pub fn publish_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Status(status) => self.publish_relay_status(status),
            RelayEvent::CubeUpdates(updates) => self.publish_cube_updates(&updates),
            RelayEvent::Log { level, message, context } => {
                self.publish_log(&level, &message, context);
            }
        }
    }

    pub fn publish_relay_status(&self, event: RelayStatusEvent) {
        let recipients = {
            let mut inner = self.inner.lock().unwrap();
            inner.relay_status.insert(event.relay_id.clone(), event.clone());
            sessions_with_stream(&inner, STREAM_RELAY_STATUS)
        };
        let envelope = Envelope::event(
            STREAM_RELAY_STATUS,
            json!({
                "relay_id": event.relay_id,
                "status": event.status,
                "message": event.message,
            }),
        );
        for session_id in recipients {
            self.ws.send(session_id, &envelope);
        }
    }

    pub fn publish_cube_updates(&self, updates: &[CubeState]) {
        if updates.is_empty() {
            return;
        }
        let timestamp = now_ms();
        let batches: Vec<(SessionId, Envelope)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscriptions
                .iter()
                .filter(|(_, sub)| stream_enabled(sub, STREAM_CUBE_UPDATE))
                .filter_map(|(session_id, sub)| {
                    let batch: Vec<Value> = updates
                        .iter()
                        .filter(|state| cube_allowed(sub, &state.cube_id))
                        .map(cube_state_json)
                        .collect();
                    if batch.is_empty() {
                        return None;
                    }
                    let envelope = Envelope {
                        kind: STREAM_CUBE_UPDATE.to_string(),
                        timestamp,
                        payload: json!({ "updates": batch }),
                    };
                    Some((*session_id, envelope))
                })
                .collect()
        };
        for (session_id, envelope) in batches {
            self.ws.send(session_id, &envelope);
        }
    }

    pub fn publish_log(&self, level: &str, message: &str, context: Value) {
        let envelope = Envelope::event(
            STREAM_LOG,
            json!({ "level": level, "message": message, "context": context }),
        );
        let recipients = {
            let inner = self.inner.lock().unwrap();
            sessions_with_stream(&inner, STREAM_LOG)
        };
        for session_id in recipients {
            self.ws.send(session_id, &envelope);
        }
    }

    pub fn publish_fleet_state(&self) {
        let envelope = Envelope::event(STREAM_FLEET_STATE, fleet_state_json(&self.fleet.snapshot()));
        let recipients = {
            let inner = self.inner.lock().unwrap();
            sessions_with_stream(&inner, STREAM_FLEET_STATE)
        };
        for session_id in recipients {
            self.ws.send(session_id, &envelope);
        }
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    fn send_snapshot(&self, session_id: SessionId, include_history: bool) {
        let relays: Vec<Value> = {
            let inner = self.inner.lock().unwrap();
            inner
                .relay_status
                .values()
                .map(|status| {
                    json!({
                        "relay_id": status.relay_id,
                        "status": status.status,
                        "message": status.message,
                    })
                })
                .collect()
        };
        let cubes: Vec<Value> = self.registry.snapshot().iter().map(cube_state_json).collect();
        let history: Vec<Value> = if include_history {
            self.registry
                .history(SNAPSHOT_HISTORY)
                .iter()
                .map(|record| {
                    let mut entry = cube_state_json(&record.state);
                    entry["timestamp"] = json!(record.timestamp);
                    entry
                })
                .collect()
        } else {
            Vec::new()
        };

        let payload = json!({
            "field": self.field_json(),
            "relays": relays,
            "cubes": cubes,
            "history": history,
        });
        self.ws.send(session_id, &Envelope::event(EVENT_SNAPSHOT, payload));
    }

    fn send_field_info(&self, session_id: SessionId) {
        self.ws.send(session_id, &Envelope::event(EVENT_FIELD_INFO, self.field_json()));
    }

    fn field_json(&self) -> Value {
        serde_json::to_value(self.field).unwrap_or_else(|_| json!({}))
    }
}

// =============================================================================
// FILTERS AND RENDERING
// =============================================================================

fn stream_enabled(subscription: &Subscription, stream: &str) -> bool {
    subscription.streams.is_empty() || subscription.streams.contains(stream)
}

fn cube_allowed(subscription: &Subscription, cube_id: &str) -> bool {
    subscription.cube_filter.is_empty() || subscription.cube_filter.contains(cube_id)
}

fn sessions_with_stream(inner: &GatewayInner, stream: &str) -> Vec<SessionId> {
    inner
        .subscriptions
        .iter()
        .filter(|(_, sub)| stream_enabled(sub, stream))
        .map(|(session_id, _)| *session_id)
        .collect()
}

fn parse_targets(payload: &Value, command: &str) -> Result<Vec<String>, GatewayError> {
    let targets = payload
        .get("targets")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::InvalidPayload(format!("{command}.targets must be array")))?;
    Ok(targets
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

fn color_channel(color: &Value, key: &str) -> u8 {
    color
        .get(key)
        .and_then(Value::as_u64)
        .map_or(0, |value| value.min(255) as u8)
}

fn cube_state_json(state: &CubeState) -> Value {
    serde_json::to_value(state).unwrap_or_else(|_| json!({}))
}

fn fleet_state_json(state: &FleetState) -> Value {
    let active: Vec<Value> = state
        .active_goals
        .iter()
        .map(|goal| {
            let mut pose = json!({ "x": goal.pose.x, "y": goal.pose.y });
            if let Some(angle) = goal.pose.angle {
                pose["angle"] = json!(angle);
            }
            json!({
                "goal_id": goal.goal_id,
                "cube_id": goal.cube_id,
                "priority": goal.priority,
                "created_at": goal.created_at,
                "pose": pose,
            })
        })
        .collect();
    json!({
        "tick_hz": state.tick_hz,
        "tasks_in_queue": state.tasks_in_queue,
        "warnings": state.warnings,
        "active_goals": active,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "gateway_test.rs"]
mod tests;
