//! Integration tests for the WebSocket server.
//!
//! # Purpose
//!
//! These tests bind the real accept loop on a loopback port and talk to it
//! with a real `tokio-tungstenite` client, so the handshake checks, the
//! per-socket task and the socket adapter are all exercised end to end.
//! Units are still the in-memory mocks.
//!
//! ```text
//! test client ──ws──► serve() ──► RealtimeChannel ──► Gateway ──► MockDevice
//! ```

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kvm_core::DeviceConfig;
use kvm_gateway::application::{Gateway, PermissionGate, PermissionLevel, TrustedUpstreamGate};
use kvm_gateway::domain::GatewayConfig;
use kvm_gateway::infrastructure::mock::{MockDevice, MockTransportFactory, RecordingAuditSink};
use kvm_gateway::infrastructure::serve;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Only `alice` may control; everyone may view.
struct AliceControls;

impl PermissionGate for AliceControls {
    fn has_permission(&self, user: &str, _device_id: &str, level: PermissionLevel) -> bool {
        level == PermissionLevel::View || user == "alice"
    }
}

struct Harness {
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    audit: Arc<RecordingAuditSink>,
    running: Arc<AtomicBool>,
}

impl Harness {
    async fn start(gate: Arc<dyn PermissionGate>) -> Self {
        let factory = MockTransportFactory::new().with_device("h1", MockDevice::pikvm());
        let audit = RecordingAuditSink::new();
        let gateway = Gateway::new(
            &GatewayConfig::default(),
            Arc::new(factory),
            gate,
            audit.clone(),
        );
        let config = DeviceConfig {
            id: "d1".to_string(),
            name: "Rack 1".to_string(),
            host: "h1".to_string(),
            port: 80,
            scheme: Default::default(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        };
        assert!(gateway.register_device(config).await);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(serve(listener, Arc::clone(&gateway), Arc::clone(&running)));

        Self {
            addr,
            gateway,
            audit,
            running,
        }
    }

    async fn connect(&self, path: &str, user: Option<&str>) -> Result<Client, WsError> {
        let mut request = format!("ws://{}{path}", self.addr)
            .into_client_request()
            .unwrap();
        if let Some(user) = user {
            request
                .headers_mut()
                .insert("x-gateway-user", HeaderValue::from_str(user).unwrap());
        }
        connect_async(request).await.map(|(ws, _)| ws)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Next text frame as JSON; `None` when the socket closed first.
async fn next_json(ws: &mut Client) -> Option<Value> {
    let deadline = Duration::from_secs(3);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Skips frames until one with the given `"type"` arrives.
async fn next_of_type(ws: &mut Client, kind: &str) -> Value {
    loop {
        let event = next_json(ws).await.expect("socket closed early");
        if event["type"] == kind {
            return event;
        }
    }
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn rejected_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

// ── Signaling ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_signaling_channel_greets_and_answers_offer() {
    // Arrange
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;
    let mut ws = h.connect("/api/webrtc/d1", Some("alice")).await.unwrap();

    // Act
    let init = next_json(&mut ws).await.unwrap();
    send(&mut ws, json!({ "type": "offer", "sdp": { "type": "offer", "sdp": "v=0" } })).await;
    let answer = next_of_type(&mut ws, "answer").await;
    send(&mut ws, json!({ "type": "ice_candidate", "candidate": { "candidate": "c1" } })).await;
    let ack = next_of_type(&mut ws, "ice_candidate_ack").await;

    // Assert
    assert_eq!(init["type"], "webrtc_init");
    assert_eq!(init["device_id"], "d1");
    assert_eq!(answer["sdp"]["type"], "answer");
    assert_eq!(ack["candidate"]["candidate"], "c1");
    let entries = h.audit.wait_for(1).await;
    assert_eq!(entries[0].user, "alice");
    assert_eq!(entries[0].action, "webrtc_offer");
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_socket_stays_open() {
    // Arrange
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;
    let mut ws = h.connect("/webrtc/d1", None).await.unwrap();
    next_of_type(&mut ws, "webrtc_init").await;

    // Act
    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let error = next_of_type(&mut ws, "error").await;
    send(&mut ws, json!({ "type": "ice_candidate", "candidate": "c2" })).await;
    let ack = next_of_type(&mut ws, "ice_candidate_ack").await;

    // Assert
    assert!(error["message"].as_str().unwrap().contains("invalid"));
    assert_eq!(ack["candidate"], "c2");
}

// ── Handshake rejections ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_path_is_rejected_with_404() {
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;

    let err = h.connect("/nowhere", Some("alice")).await.unwrap_err();

    assert_eq!(rejected_status(err), 404);
}

#[tokio::test]
async fn test_stream_control_without_control_level_is_rejected_with_403() {
    let h = Harness::start(Arc::new(AliceControls)).await;

    let err = h.connect("/stream/d1", Some("bob")).await.unwrap_err();

    assert_eq!(rejected_status(err), 403);
}

#[tokio::test]
async fn test_unknown_device_gets_error_then_close() {
    // Arrange
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;
    let mut ws = h.connect("/webrtc/ghost", Some("alice")).await.unwrap();

    // Act
    let first = next_json(&mut ws).await.unwrap();
    let after = next_json(&mut ws).await;

    // Assert
    assert_eq!(first["type"], "error");
    assert!(first["message"].as_str().unwrap().contains("ghost"));
    assert!(after.is_none());
}

// ── Stream control ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_then_stop_stream_over_the_socket() {
    // Arrange
    let h = Harness::start(Arc::new(AliceControls)).await;
    let mut ws = h.connect("/stream/d1", Some("alice")).await.unwrap();

    // Act
    send(&mut ws, json!({ "type": "start_stream", "stream_type": "h264" })).await;
    let started = next_of_type(&mut ws, "stream_started").await;
    send(&mut ws, json!({ "type": "stop_stream" })).await;
    let stopped = next_of_type(&mut ws, "stream_stopped").await;

    // Assert
    assert_eq!(started["stream"]["stream_id"], "d1_h264");
    assert_eq!(started["stream"]["already_active"], false);
    assert_eq!(stopped["stopped_streams"], json!(["h264"]));
    assert!(h.gateway.streams.get_active_streams().await.is_empty());
}

#[tokio::test]
async fn test_quality_change_reaches_signaling_viewers() {
    // Arrange
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;
    let mut viewer = h.connect("/webrtc/d1", Some("carol")).await.unwrap();
    next_of_type(&mut viewer, "webrtc_init").await;
    let mut control = h.connect("/stream/d1", Some("alice")).await.unwrap();
    send(&mut control, json!({ "type": "start_stream", "stream_type": "webrtc" })).await;
    next_of_type(&mut control, "stream_started").await;

    // Act
    send(&mut control, json!({ "type": "quality_change", "quality": "high" })).await;
    let changed = next_of_type(&mut viewer, "quality_changed").await;

    // Assert
    assert_eq!(changed["old_quality"], "medium");
    assert_eq!(changed["new_quality"], "high");

    h.gateway.shutdown().await;
}

// ── Events and rooms ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_channel_starts_with_current_status() {
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;
    let mut ws = h.connect("/events", Some("alice")).await.unwrap();

    let status = next_json(&mut ws).await.unwrap();

    assert_eq!(status["type"], "device_status");
    assert_eq!(status["report"]["device_id"], "d1");
    assert_eq!(status["report"]["connected"], true);
}

#[tokio::test]
async fn test_room_members_see_each_other_join_and_leave() {
    // Arrange
    let h = Harness::start(Arc::new(TrustedUpstreamGate)).await;
    let mut first = h.connect("/rooms/ops", Some("alice")).await.unwrap();
    next_of_type(&mut first, "room_presence").await;

    // Act
    let mut second = h.connect("/rooms/ops", Some("bob")).await.unwrap();
    let joined = next_of_type(&mut first, "room_presence").await;
    second.close(None).await.unwrap();
    let left = next_of_type(&mut first, "room_presence").await;

    // Assert
    assert_eq!(joined["user"], "bob");
    assert_eq!(joined["joined"], true);
    assert_eq!(joined["members"], 2);
    assert_eq!(left["user"], "bob");
    assert_eq!(left["joined"], false);
    assert_eq!(left["members"], 1);
}
