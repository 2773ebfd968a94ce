//! Relay wire protocol.
//!
//! Outbound envelopes are `{type: "command"|"query", payload: {...}}`.
//! Inbound envelopes are `{type: "response"|"system"|"error", payload: {...}}`.
//! Relays run on embedded bridges with loose serializers, so inbound parsing
//! is field-tolerant: a field is used only when it is present with the
//! expected JSON type, and anything else is skipped rather than rejected.

use serde_json::{json, Value};

use crate::registry::{LedColor, LedUpdate, PoseUpdate};

// =============================================================================
// OUTBOUND
// =============================================================================

/// Drive command with independent wheel speeds.
#[must_use]
pub fn move_command(target: &str, left: i64, right: i64) -> Value {
    json!({
        "type": "command",
        "payload": {
            "cmd": "move",
            "target": target,
            "params": { "left_speed": left, "right_speed": right },
            "require_result": false,
        },
    })
}

/// LED color command.
#[must_use]
pub fn led_command(target: &str, color: LedColor) -> Value {
    json!({
        "type": "command",
        "payload": {
            "cmd": "led",
            "target": target,
            "params": { "r": color.r, "g": color.g, "b": color.b },
            "require_result": false,
        },
    })
}

/// Ask the relay to open a BLE connection to the cube.
#[must_use]
pub fn connect_command(target: &str) -> Value {
    json!({
        "type": "command",
        "payload": {
            "cmd": "connect",
            "target": target,
            "require_result": false,
        },
    })
}

/// Position query. With `notify` the relay streams every position change.
#[must_use]
pub fn position_query(target: &str, notify: bool) -> Value {
    json!({
        "type": "query",
        "payload": {
            "info": "position",
            "target": target,
            "notify": notify,
        },
    })
}

/// One-shot battery query.
#[must_use]
pub fn battery_query(target: &str) -> Value {
    json!({
        "type": "query",
        "payload": {
            "info": "battery",
            "target": target,
        },
    })
}

/// The message sequence that re-establishes device state for one cube after
/// a relay (re)connect: BLE connect, position subscription, battery one-shot.
#[must_use]
pub fn bootstrap_sequence(cube_id: &str) -> Vec<Value> {
    vec![
        connect_command(cube_id),
        position_query(cube_id, true),
        battery_query(cube_id),
    ]
}

// =============================================================================
// INBOUND
// =============================================================================

/// A relay message reduced to what the manager acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Position telemetry, possibly with a piggybacked LED readback.
    Position {
        target: String,
        position: Option<PoseUpdate>,
        led: Option<LedUpdate>,
    },
    /// Battery telemetry.
    Battery { target: String, level: Option<i64> },
    /// Informational message from the relay process itself.
    System(Value),
    /// Error reported by the relay.
    Error(String),
    /// Anything malformed or not addressed to us.
    Ignored,
}

/// Classify one inbound relay document.
#[must_use]
pub fn parse_message(message: &Value) -> RelayMessage {
    let Some(kind) = message.get("type").and_then(Value::as_str) else {
        return RelayMessage::Ignored;
    };
    let payload = message.get("payload");

    match kind {
        "response" => {
            let Some(payload) = payload.filter(|p| p.is_object()) else {
                return RelayMessage::Ignored;
            };
            parse_response(payload)
        }
        "system" => RelayMessage::System(payload.cloned().unwrap_or(Value::Null)),
        "error" => {
            let text = payload
                .and_then(|p| p.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            RelayMessage::Error(text.to_string())
        }
        _ => RelayMessage::Ignored,
    }
}

fn parse_response(payload: &Value) -> RelayMessage {
    let info = payload.get("info").and_then(Value::as_str).unwrap_or_default();
    let target = payload
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if target.is_empty() {
        return RelayMessage::Ignored;
    }

    match info {
        "position" => RelayMessage::Position {
            target,
            position: payload.get("position").and_then(parse_pose),
            led: payload.get("led").and_then(parse_led),
        },
        "battery" => RelayMessage::Battery {
            target,
            level: payload.get("battery_level").and_then(Value::as_i64),
        },
        _ => RelayMessage::Ignored,
    }
}

/// Build a pose patch carrying only the components present with the right
/// type. The relay's frames are sparse; components it did not report must
/// not touch the stored pose.
fn parse_pose(value: &Value) -> Option<PoseUpdate> {
    if !value.is_object() {
        return None;
    }
    let patch = PoseUpdate {
        x: value.get("x").and_then(Value::as_f64),
        y: value.get("y").and_then(Value::as_f64),
        deg: value.get("angle").and_then(Value::as_f64),
        on_mat: value.get("on_mat").and_then(Value::as_bool),
    };
    (!patch.is_empty()).then_some(patch)
}

fn parse_led(value: &Value) -> Option<LedUpdate> {
    if !value.is_object() {
        return None;
    }
    let patch = LedUpdate {
        r: value.get("r").and_then(Value::as_i64).map(clamp_channel),
        g: value.get("g").and_then(Value::as_i64).map(clamp_channel),
        b: value.get("b").and_then(Value::as_i64).map(clamp_channel),
    };
    (!patch.is_empty()).then_some(patch)
}

fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
