use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::*;
use crate::config::config_from_str;

fn test_config() -> ControlServerConfig {
    config_from_str(
        r#"{
            "ui": { "port": 8765 },
            "relays": [
                { "id": "r1", "uri": "ws://relay-a:9001/ws", "cubes": ["A01", "A02"] },
                { "id": "r2", "uri": "ws://relay-b:9001/ws", "cubes": ["B01"] }
            ]
        }"#,
    )
    .expect("test config")
}

fn manager() -> (Arc<RelayManager>, UnboundedReceiver<RelayEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(CubeRegistry::new());
    (Arc::new(RelayManager::new(registry, &test_config(), events_tx)), events_rx)
}

fn recv_json(rx: &mut UnboundedReceiver<String>) -> Value {
    serde_json::from_str(&rx.try_recv().expect("expected relay traffic")).expect("valid json")
}

#[test]
fn cube_routing_is_total_over_config() {
    let (manager, _events) = manager();
    assert_eq!(manager.relay_for_cube("A01"), Some("r1"));
    assert_eq!(manager.relay_for_cube("A02"), Some("r1"));
    assert_eq!(manager.relay_for_cube("B01"), Some("r2"));
    assert_eq!(manager.relay_for_cube("ZZZ"), None);
}

#[test]
fn unknown_cube_is_rejected_with_no_traffic() {
    let (manager, _events) = manager();
    let mut wire = manager.connect_for_tests("r1");

    let err = manager
        .send_manual_drive(&["ZZZ".to_string()], 30, 30)
        .expect_err("unknown cube must fail");
    assert_eq!(err, RelayError::UnknownCube("ZZZ".into()));
    assert!(err.to_string().contains("ZZZ"));
    assert!(wire.try_recv().is_err(), "no relay traffic for unknown cube");
}

#[test]
fn disconnected_relay_is_rejected() {
    let (manager, _events) = manager();
    let err = manager
        .send_manual_drive(&["A01".to_string()], 10, 10)
        .expect_err("stopped relay must fail");
    assert_eq!(err, RelayError::NotConnected("r1".into()));
}

#[test]
fn empty_targets_rejected() {
    let (manager, _events) = manager();
    assert_eq!(
        manager.send_manual_drive(&[], 0, 0),
        Err(RelayError::NoTargets { command: "manual_drive" })
    );
    assert_eq!(
        manager.send_led(&[], LedColor::default()),
        Err(RelayError::NoTargets { command: "set_led" })
    );
}

#[test]
fn drive_fans_out_one_envelope_per_target() {
    let (manager, _events) = manager();
    let mut wire = manager.connect_for_tests("r1");

    manager
        .send_manual_drive(&["A01".to_string(), "A02".to_string()], 40, -40)
        .expect("both cubes on a connected relay");

    let first = recv_json(&mut wire);
    assert_eq!(first["payload"]["cmd"], "move");
    assert_eq!(first["payload"]["target"], "A01");
    assert_eq!(first["payload"]["params"]["left_speed"], 40);
    let second = recv_json(&mut wire);
    assert_eq!(second["payload"]["target"], "A02");
    assert!(wire.try_recv().is_err());
}

#[test]
fn led_commands_route_across_relays() {
    let (manager, _events) = manager();
    let mut wire_a = manager.connect_for_tests("r1");
    let mut wire_b = manager.connect_for_tests("r2");

    manager
        .send_led(&["A01".to_string(), "B01".to_string()], LedColor { r: 255, g: 0, b: 0 })
        .expect("both relays connected");

    assert_eq!(recv_json(&mut wire_a)["payload"]["target"], "A01");
    assert_eq!(recv_json(&mut wire_b)["payload"]["target"], "B01");
}

#[test]
fn batch_aborts_at_first_failure_without_rollback() {
    let (manager, _events) = manager();
    let mut wire = manager.connect_for_tests("r1");

    let err = manager
        .send_manual_drive(&["A01".to_string(), "ZZZ".to_string(), "A02".to_string()], 5, 5)
        .expect_err("middle target is unknown");
    assert_eq!(err, RelayError::UnknownCube("ZZZ".into()));

    // A01 was already sent and is not rolled back; A02 was never reached.
    assert_eq!(recv_json(&mut wire)["payload"]["target"], "A01");
    assert!(wire.try_recv().is_err());
}

#[test]
fn connected_status_triggers_bootstrap_in_order() {
    let (manager, mut events) = manager();
    let mut wire = manager.connect_for_tests("r2");

    manager.handle_connection_event(ConnectionEvent::Status {
        relay_id: "r2".into(),
        state: ConnectionState::Connected,
        message: "connected".into(),
    });

    // Status event reaches the gateway side.
    match events.try_recv().expect("status event") {
        RelayEvent::Status(status) => {
            assert_eq!(status.relay_id, "r2");
            assert_eq!(status.status, "connected");
            assert_eq!(status.message, "connected");
        }
        other => panic!("expected status, got {other:?}"),
    }

    // Bootstrap for B01: connect, position subscription, battery one-shot.
    let connect = recv_json(&mut wire);
    assert_eq!(connect["payload"]["cmd"], "connect");
    assert_eq!(connect["payload"]["target"], "B01");
    let subscribe = recv_json(&mut wire);
    assert_eq!(subscribe["payload"]["info"], "position");
    assert_eq!(subscribe["payload"]["notify"], true);
    let battery = recv_json(&mut wire);
    assert_eq!(battery["payload"]["info"], "battery");
    assert!(wire.try_recv().is_err());
}

#[test]
fn stopped_status_updates_state_and_blocks_commands() {
    let (manager, mut events) = manager();
    let _wire = manager.connect_for_tests("r1");
    assert!(manager.send_manual_drive(&["A01".to_string()], 1, 1).is_ok());

    manager.handle_connection_event(ConnectionEvent::Status {
        relay_id: "r1".into(),
        state: ConnectionState::Stopped,
        message: "read error".into(),
    });
    while events.try_recv().is_ok() {}

    assert_eq!(
        manager.send_manual_drive(&["A01".to_string()], 1, 1),
        Err(RelayError::NotConnected("r1".into()))
    );
}

#[test]
fn position_response_updates_registry_and_publishes_diff() {
    let (manager, mut events) = manager();
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({
            "type": "response",
            "payload": {
                "info": "position",
                "target": "A01",
                "position": { "x": 120, "y": 80, "angle": 90, "on_mat": true },
            },
        }),
    });

    match events.try_recv().expect("cube update event") {
        RelayEvent::CubeUpdates(updates) => {
            assert_eq!(updates.len(), 1);
            let state = &updates[0];
            assert_eq!(state.cube_id, "A01");
            assert_eq!(state.relay_id, "r1");
            let pose = state.position.expect("pose recorded");
            assert!((pose.x - 120.0).abs() < f64::EPSILON);
            assert!((pose.deg - 90.0).abs() < f64::EPSILON);
        }
        other => panic!("expected cube updates, got {other:?}"),
    }
}

#[test]
fn sparse_position_response_preserves_known_components() {
    let (manager, mut events) = manager();
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({
            "type": "response",
            "payload": {
                "info": "position",
                "target": "A01",
                "position": { "x": 120, "y": 80, "angle": 90, "on_mat": true },
            },
        }),
    });
    events.try_recv().expect("first fix is a diff");

    // A heading-only frame must update deg and leave x/y/on_mat alone.
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({
            "type": "response",
            "payload": { "info": "position", "target": "A01", "position": { "angle": 45 } },
        }),
    });
    match events.try_recv().expect("heading change is a diff") {
        RelayEvent::CubeUpdates(updates) => {
            let pose = updates[0].position.expect("pose retained");
            assert!((pose.x - 120.0).abs() < f64::EPSILON, "x must survive a sparse frame");
            assert!((pose.y - 80.0).abs() < f64::EPSILON, "y must survive a sparse frame");
            assert!((pose.deg - 45.0).abs() < f64::EPSILON);
            assert!(pose.on_mat, "on_mat must survive a sparse frame");
        }
        other => panic!("expected cube updates, got {other:?}"),
    }
}

#[test]
fn partial_led_readback_preserves_known_channels() {
    let (manager, mut events) = manager();
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({
            "type": "response",
            "payload": {
                "info": "position",
                "target": "A01",
                "led": { "r": 255, "g": 128, "b": 64 },
            },
        }),
    });
    events.try_recv().expect("first readback is a diff");

    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({
            "type": "response",
            "payload": { "info": "position", "target": "A01", "led": { "r": 10 } },
        }),
    });
    match events.try_recv().expect("red channel change is a diff") {
        RelayEvent::CubeUpdates(updates) => {
            assert_eq!(updates[0].led, LedColor { r: 10, g: 128, b: 64 });
        }
        other => panic!("expected cube updates, got {other:?}"),
    }
}

#[test]
fn battery_response_updates_registry() {
    let (manager, mut events) = manager();
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({
            "type": "response",
            "payload": { "info": "battery", "target": "A01", "battery_level": 70 },
        }),
    });

    match events.try_recv().expect("cube update event") {
        RelayEvent::CubeUpdates(updates) => assert_eq!(updates[0].battery, Some(70)),
        other => panic!("expected cube updates, got {other:?}"),
    }
}

#[test]
fn duplicate_telemetry_publishes_nothing() {
    let (manager, mut events) = manager();
    let message = json!({
        "type": "response",
        "payload": { "info": "battery", "target": "A01", "battery_level": 70 },
    });
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: message.clone(),
    });
    events.try_recv().expect("first battery reading is a diff");

    manager.handle_connection_event(ConnectionEvent::Message { relay_id: "r1".into(), message });
    assert!(events.try_recv().is_err(), "identical reading must not fan out");
}

#[tokio::test]
async fn bootstrap_and_ingest_against_live_fake_relay() {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let config = config_from_str(&format!(
        r#"{{
            "ui": {{ "port": 8765 }},
            "relays": [ {{ "id": "r1", "uri": "ws://127.0.0.1:{port}/ws", "cubes": ["A01"] }} ],
            "relay_reconnect_ms": 50
        }}"#,
    ))
    .expect("config");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let registry = Arc::new(CubeRegistry::new());
    let manager = Arc::new(RelayManager::new(Arc::clone(&registry), &config, events_tx));

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        let mut received = Vec::new();
        for _ in 0..3 {
            let message = ws.next().await.expect("frame").expect("frame ok");
            let value: Value =
                serde_json::from_str(message.to_text().expect("text")).expect("valid json");
            received.push(value);
        }
        let response = json!({
            "type": "response",
            "payload": {
                "info": "position",
                "target": "A01",
                "position": { "x": 120, "y": 80, "angle": 90, "on_mat": true },
            },
        });
        ws.send(Message::Text(response.to_string().into())).await.expect("send");
        received
    });

    manager.start();

    async fn next_event(events: &mut UnboundedReceiver<RelayEvent>) -> RelayEvent {
        timeout(WAIT, events.recv()).await.expect("event in time").expect("channel open")
    }

    match next_event(&mut events).await {
        RelayEvent::Status(status) => assert_eq!(status.status, "connecting"),
        other => panic!("expected connecting, got {other:?}"),
    }
    match next_event(&mut events).await {
        RelayEvent::Status(status) => {
            assert_eq!(status.status, "connected");
            assert_eq!(status.message, "connected");
        }
        other => panic!("expected connected, got {other:?}"),
    }
    match next_event(&mut events).await {
        RelayEvent::CubeUpdates(updates) => {
            assert_eq!(updates[0].cube_id, "A01");
            let pose = updates[0].position.expect("pose");
            assert!((pose.x - 120.0).abs() < f64::EPSILON);
        }
        other => panic!("expected cube updates, got {other:?}"),
    }

    // The fake relay saw the bootstrap sequence for A01 in order.
    let received = relay.await.expect("relay task");
    assert_eq!(received[0]["payload"]["cmd"], "connect");
    assert_eq!(received[0]["payload"]["target"], "A01");
    assert_eq!(received[1]["payload"]["info"], "position");
    assert_eq!(received[1]["payload"]["notify"], true);
    assert_eq!(received[2]["payload"]["info"], "battery");

    manager.stop();
}

#[test]
fn system_and_error_messages_become_log_events() {
    let (manager, mut events) = manager();
    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({ "type": "system", "payload": { "uptime": 3 } }),
    });
    match events.try_recv().expect("log event") {
        RelayEvent::Log { level, context, .. } => {
            assert_eq!(level, "info");
            assert_eq!(context["relay_id"], "r1");
            assert_eq!(context["message"]["uptime"], 3);
        }
        other => panic!("expected log, got {other:?}"),
    }

    manager.handle_connection_event(ConnectionEvent::Message {
        relay_id: "r1".into(),
        message: json!({ "type": "error", "payload": { "message": "BLE write failed" } }),
    });
    match events.try_recv().expect("log event") {
        RelayEvent::Log { level, message, .. } => {
            assert_eq!(level, "error");
            assert_eq!(message, "BLE write failed");
        }
        other => panic!("expected log, got {other:?}"),
    }
}
