//! Envelope — the UI wire protocol for the control server.
//!
//! ARCHITECTURE
//! ============
//! Every message between a UI session and the server is an envelope.
//! Outbound: `{type, timestamp, payload}` where `type` is one of
//! ack / error / snapshot / field_info / relay_status / cube_update /
//! fleet_state / log. Inbound: `{type, request_id?, payload}` where `type`
//! selects the gateway handler. Timestamps are milliseconds since Unix epoch.
//!
//! DESIGN
//! ======
//! - Commands carry an optional correlation `request_id`; the matching
//!   ack/error echoes it back.
//! - Errors are normal envelopes, never a transport-level close.
//! - `GatewayError` maps every failure onto one of the three wire codes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::fleet::FleetError;
use crate::relay::manager::RelayError;

// =============================================================================
// EVENT TYPES
// =============================================================================

pub const EVENT_ACK: &str = "ack";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_SNAPSHOT: &str = "snapshot";
pub const EVENT_FIELD_INFO: &str = "field_info";

/// Filterable event streams a session can subscribe to.
pub const STREAM_RELAY_STATUS: &str = "relay_status";
pub const STREAM_CUBE_UPDATE: &str = "cube_update";
pub const STREAM_FLEET_STATE: &str = "fleet_state";
pub const STREAM_LOG: &str = "log";

/// Streams enabled for a session that never sent `subscribe`.
pub const DEFAULT_STREAMS: [&str; 4] = [
    STREAM_RELAY_STATUS,
    STREAM_CUBE_UPDATE,
    STREAM_FLEET_STATE,
    STREAM_LOG,
];

// =============================================================================
// ENVELOPE
// =============================================================================

/// An outbound message to a UI session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub payload: Value,
}

impl Envelope {
    /// Build an event envelope stamped with the current time.
    pub fn event(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), timestamp: now_ms(), payload }
    }

    /// Successful reply to a command. `details` is attached when present.
    pub fn ack(request_id: &str, details: Option<Value>) -> Self {
        let mut payload = json!({ "request_id": request_id });
        if let Some(details) = details {
            payload["details"] = details;
        }
        Self::event(EVENT_ACK, payload)
    }

    /// Error reply to a command.
    pub fn error(request_id: &str, error: &GatewayError) -> Self {
        Self::event(
            EVENT_ERROR,
            json!({
                "request_id": request_id,
                "code": error.code(),
                "message": error.to_string(),
            }),
        )
    }
}

/// An inbound command from a UI session.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: String,
    pub request_id: String,
    pub payload: Value,
}

impl Command {
    /// Pick the command out of a raw JSON document.
    ///
    /// `type` must be a string; `request_id` defaults to empty and `payload`
    /// to an empty object so handlers can validate field-by-field.
    pub fn parse(message: &Value) -> Result<Self, GatewayError> {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidPayload("message.type must be string".into()))?
            .to_string();
        let request_id = message
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = message.get("payload").cloned().unwrap_or_else(|| json!({}));
        Ok(Self { kind, request_id, payload })
    }
}

// =============================================================================
// GATEWAY ERRORS
// =============================================================================

/// Failures surfaced to UI clients as `error` envelopes.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Client-side fault: malformed JSON, missing field, wrong type.
    #[error("{0}")]
    InvalidPayload(String),
    /// Transport failure: unknown cube or relay not connected.
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// Goal request rejected by the orchestrator.
    #[error(transparent)]
    Fleet(#[from] FleetError),
    /// Unexpected failure inside a handler.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Grepable wire code carried in the error payload.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) | Self::Fleet(_) => "invalid_payload",
            Self::Relay(_) => "relay_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
