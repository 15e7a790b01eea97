//! Integration tests for the gateway's command and streaming surface.
//!
//! # Purpose
//!
//! These tests drive [`Gateway`] through its public API the way the API
//! layer and the WebSocket server do, with in-memory units standing in for
//! real hardware.  They verify:
//!
//! - Starting a stream twice yields one running task.
//! - Stopping streams leaves no task or registry entry behind.
//! - Streams of different devices never affect each other.
//! - Commands are permission-checked and audited.
//! - Deregistering a unit tears down everything attached to it, and an
//!   unreachable unit is never registered.

use std::sync::Arc;
use std::time::Duration;

use kvm_core::{
    ConnectionStatus, DeviceConfig, ErrorKind, GatewayEvent, PowerAction, StreamConfig,
    StreamKey, StreamType,
};
use kvm_gateway::application::transport::Method;
use kvm_gateway::application::{
    DeviceCommand, Gateway, PermissionGate, PermissionLevel, TrustedUpstreamGate,
};
use kvm_gateway::domain::GatewayConfig;
use kvm_gateway::infrastructure::mock::{
    MockDevice, MockTransportFactory, RecordingAuditSink, RecordingSubscriber,
};
use serde_json::json;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn device(id: &str, host: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        name: format!("Rack {id}"),
        host: host.to_string(),
        port: 80,
        scheme: Default::default(),
        username: "admin".to_string(),
        password: "admin".to_string(),
    }
}

/// Grants `view` to everyone and nothing more.
struct ViewOnlyGate;

impl PermissionGate for ViewOnlyGate {
    fn has_permission(&self, _user: &str, _device_id: &str, level: PermissionLevel) -> bool {
        level == PermissionLevel::View
    }
}

/// A gateway with two healthy units, `d1` and `d2`.
async fn two_device_gateway(
    gate: Arc<dyn PermissionGate>,
) -> (Arc<Gateway>, MockTransportFactory, Arc<RecordingAuditSink>) {
    let factory = MockTransportFactory::new()
        .with_device("h1", MockDevice::pikvm())
        .with_device("h2", MockDevice::pikvm());
    let audit = RecordingAuditSink::new();
    let gateway = Gateway::new(
        &GatewayConfig::default(),
        Arc::new(factory.clone()),
        gate,
        audit.clone(),
    );
    assert!(gateway.register_device(device("d1", "h1")).await);
    assert!(gateway.register_device(device("d2", "h2")).await);
    (gateway, factory, audit)
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_double_start_runs_one_task_and_reports_already_active() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;
    let config = StreamConfig::new("d1").with_type(StreamType::Webrtc);

    // Act
    let first = gw.streams.start_stream(config.clone()).await;
    let second = gw.streams.start_stream(config).await;

    // Assert
    assert!(!first.already_active);
    assert!(second.already_active);
    assert_eq!(first.stream_id, "d1_webrtc");
    assert_eq!(second.stream_id, "d1_webrtc");
    assert_eq!(gw.streams.get_active_streams().await.len(), 1);
    assert_eq!(gw.streams.running_tasks().await, 1);

    gw.shutdown().await;
}

#[tokio::test]
async fn test_untyped_stop_leaves_nothing_behind() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;
    for t in StreamType::ALL {
        gw.streams.start_stream(StreamConfig::new("d1").with_type(t)).await;
    }
    let viewer = RecordingSubscriber::new();
    gw.streams.add_viewer("d1", viewer.clone()).await;

    // Act
    let stopped = gw.streams.stop_stream("d1", None).await;

    // Assert
    assert_eq!(stopped, vec![StreamType::Webrtc, StreamType::Mjpeg, StreamType::H264]);
    assert!(gw.streams.get_active_streams().await.is_empty());
    assert_eq!(gw.streams.running_tasks().await, 0);
    for t in StreamType::ALL {
        assert_eq!(gw.streams.stream_state(&StreamKey::new("d1", t)).await, None);
    }
    let last_stopped = viewer.events().into_iter().rev().find_map(|e| match e {
        GatewayEvent::StreamStopped { stopped_streams, .. } => Some(stopped_streams),
        _ => None,
    });
    assert_eq!(last_stopped.map(|s| s.len()), Some(3));
    assert!(viewer.is_closed());
}

#[tokio::test]
async fn test_stopping_one_device_does_not_touch_another() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;
    gw.streams.start_stream(StreamConfig::new("d1")).await;
    gw.streams.start_stream(StreamConfig::new("d2")).await;
    let other = RecordingSubscriber::new();
    gw.streams.add_viewer("d2", other.clone()).await;

    // Act
    let stopped = gw.streams.stop_stream("d1", Some(StreamType::Webrtc)).await;

    // Assert
    assert_eq!(stopped, vec![StreamType::Webrtc]);
    let remaining: Vec<String> = gw
        .streams
        .get_active_streams()
        .await
        .into_iter()
        .map(|s| s.stream_id)
        .collect();
    assert_eq!(remaining, vec!["d2_webrtc".to_string()]);
    assert!(!other.is_closed());
    assert!(!other.event_types().contains(&"stream_stopped".to_string()));

    gw.shutdown().await;
}

#[tokio::test]
async fn test_stop_of_unknown_type_is_a_noop() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;
    gw.streams.start_stream(StreamConfig::new("d1")).await;

    // Act
    let stopped = gw.streams.stop_stream("d1", Some(StreamType::H264)).await;

    // Assert
    assert!(stopped.is_empty());
    assert_eq!(gw.streams.get_active_streams().await.len(), 1);

    gw.shutdown().await;
}

#[tokio::test]
async fn test_mjpeg_viewer_receives_frames() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;
    let viewer = RecordingSubscriber::new();
    gw.streams.add_viewer("d1", viewer.clone()).await;
    let mut config = StreamConfig::new("d1").with_type(StreamType::Mjpeg);
    config.fps = 50;

    // Act
    gw.streams.start_stream(config).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    gw.streams.stop_stream("d1", Some(StreamType::Mjpeg)).await;

    // Assert
    let frames = viewer
        .event_types()
        .iter()
        .filter(|t| t.as_str() == "mjpeg_frame")
        .count();
    assert!(frames >= 1, "expected at least one frame, got {frames}");
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_permitted_command_is_executed_and_audited() {
    // Arrange
    let (gw, factory, audit) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;

    // Act
    let result = gw
        .execute(
            "alice",
            "d1",
            DeviceCommand::Power {
                action: PowerAction::PowerOn,
            },
        )
        .await;

    // Assert
    assert!(result.success, "{result:?}");
    let posts: Vec<_> = factory
        .requests_to("/api/atx")
        .into_iter()
        .filter(|r| r.method == Method::Post)
        .collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].body, Some(json!({ "action": "power_on" })));
    let entries = audit.wait_for(1).await;
    assert_eq!(entries[0].user, "alice");
    assert_eq!(entries[0].device_id, "d1");
}

#[tokio::test]
async fn test_control_command_without_control_level_is_auth_failure() {
    // Arrange
    let (gw, factory, audit) = two_device_gateway(Arc::new(ViewOnlyGate)).await;
    factory.clear_requests();

    // Act
    let result = gw.execute("bob", "d1", DeviceCommand::ResetHid).await;

    // Assert
    assert!(!result.success);
    assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::Auth));
    assert!(factory.requests().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(audit.entries().is_empty());
}

#[tokio::test]
async fn test_snapshot_needs_only_view() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(ViewOnlyGate)).await;

    // Act
    let result = gw.execute("bob", "d2", DeviceCommand::Snapshot).await;

    // Assert
    assert!(result.success, "{result:?}");
}

// ── Device lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_deregister_tears_down_streams_sockets_and_entry() {
    // Arrange
    let (gw, _, _) = two_device_gateway(Arc::new(TrustedUpstreamGate)).await;
    gw.streams.start_stream(StreamConfig::new("d1")).await;
    let viewer = RecordingSubscriber::new();
    gw.signaling.add_subscriber("d1", viewer.clone()).await;

    // Act
    let removed = gw.deregister_device("d1").await;

    // Assert
    assert!(removed);
    assert!(gw.registry.get("d1").await.is_none());
    assert!(gw.streams.get_active_streams().await.is_empty());
    assert!(viewer.is_closed());
    assert!(!gw.deregister_device("d1").await);

    gw.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_unit_is_not_registered() {
    // Arrange
    let factory = MockTransportFactory::new().with_device("h1", MockDevice::unreachable());
    let gw = Gateway::new(
        &GatewayConfig::default(),
        Arc::new(factory),
        Arc::new(TrustedUpstreamGate),
        RecordingAuditSink::new(),
    );

    // Act
    let registered = gw.register_device(device("d1", "h1")).await;

    // Assert
    assert!(!registered);
    assert!(gw.registry.get("d1").await.is_none());
    let report = gw.registry.get_device_status("d1").await;
    assert_eq!(report.status, ConnectionStatus::Error);
    assert!(!report.connected);
}
