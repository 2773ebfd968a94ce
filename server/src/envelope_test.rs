use serde_json::json;

use super::*;

#[test]
fn event_sets_kind_and_timestamp() {
    let env = Envelope::event(STREAM_LOG, json!({"level": "info"}));
    assert_eq!(env.kind, "log");
    assert!(env.timestamp > 0);
    assert_eq!(env.payload["level"], "info");
}

#[test]
fn ack_without_details_omits_details_key() {
    let env = Envelope::ack("req-1", None);
    assert_eq!(env.kind, EVENT_ACK);
    assert_eq!(env.payload["request_id"], "req-1");
    assert!(env.payload.get("details").is_none());
}

#[test]
fn ack_with_details_carries_them() {
    let env = Envelope::ack("req-2", Some(json!({"goal_id": "goal-1"})));
    assert_eq!(env.payload["details"]["goal_id"], "goal-1");
}

#[test]
fn error_carries_code_and_message() {
    let err = GatewayError::InvalidPayload("targets must be array".into());
    let env = Envelope::error("req-3", &err);
    assert_eq!(env.kind, EVENT_ERROR);
    assert_eq!(env.payload["request_id"], "req-3");
    assert_eq!(env.payload["code"], "invalid_payload");
    assert_eq!(env.payload["message"], "targets must be array");
}

#[test]
fn error_codes_map_by_kind() {
    assert_eq!(GatewayError::InvalidPayload(String::new()).code(), "invalid_payload");
    assert_eq!(
        GatewayError::Relay(RelayError::UnknownCube("ZZZ".into())).code(),
        "relay_error"
    );
    assert_eq!(GatewayError::Fleet(FleetError::EmptyTargets).code(), "invalid_payload");
    assert_eq!(GatewayError::Internal(String::new()).code(), "internal_error");
}

#[test]
fn envelope_json_round_trip() {
    let original = Envelope::event(STREAM_CUBE_UPDATE, json!({"updates": []}));
    let text = serde_json::to_string(&original).expect("serialize");
    let restored: Envelope = serde_json::from_str(&text).expect("deserialize");
    assert_eq!(restored, original);
}

#[test]
fn envelope_serializes_type_key() {
    let env = Envelope::event(EVENT_FIELD_INFO, json!({}));
    let value = serde_json::to_value(&env).expect("to_value");
    assert_eq!(value["type"], "field_info");
    assert!(value.get("kind").is_none());
}

#[test]
fn command_parse_happy_path() {
    let raw = json!({
        "type": "manual_drive",
        "request_id": "r-9",
        "payload": {"targets": ["A01"], "left": 30, "right": 30}
    });
    let cmd = Command::parse(&raw).expect("parse");
    assert_eq!(cmd.kind, "manual_drive");
    assert_eq!(cmd.request_id, "r-9");
    assert_eq!(cmd.payload["left"], 30);
}

#[test]
fn command_parse_defaults_request_id_and_payload() {
    let cmd = Command::parse(&json!({"type": "request_snapshot"})).expect("parse");
    assert_eq!(cmd.request_id, "");
    assert!(cmd.payload.is_object());
}

#[test]
fn command_parse_rejects_missing_type() {
    let err = Command::parse(&json!({"payload": {}})).expect_err("must fail");
    assert_eq!(err.code(), "invalid_payload");
}

#[test]
fn command_parse_rejects_non_string_type() {
    let err = Command::parse(&json!({"type": 7})).expect_err("must fail");
    assert!(err.to_string().contains("type"));
}
