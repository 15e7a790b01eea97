//! The assembled gateway: one registry, one session manager, one stream
//! orchestrator, and one fanout per purpose.
//!
//! [`Gateway`] is what the WebSocket server and the binary hold on to.  It
//! also provides [`Gateway::execute`], the permission-checked and audited
//! entry point the outer API layer uses for hardware commands.

use std::sync::Arc;

use kvm_core::{
    CommandResult, DeviceConfig, DeviceStatusReport, GatewayError, GatewayEvent, PowerAction,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::collaborators::{AuditSink, PermissionGate, PermissionLevel};
use super::fanout::{BroadcastReport, ConnectionFanout};
use super::registry::{DeviceRegistry, ProbeTimeouts};
use super::session::{HardwareSessionManager, SessionTimeouts};
use super::streaming::{StreamOrchestrator, StreamTimings};
use super::transport::TransportFactory;
use crate::domain::config::GatewayConfig;

/// Topic of the device event bus carrying `device_status` events.
pub const DEVICE_EVENTS_TOPIC: &str = "devices";

/// A hardware command as submitted by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    Power {
        action: PowerAction,
    },
    Keyboard {
        keys: Vec<String>,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Mouse {
        x: i32,
        y: i32,
        #[serde(default)]
        buttons: Vec<String>,
        #[serde(default)]
        scroll: i32,
    },
    Snapshot,
    ResetHid,
    StreamerParams {
        quality: u8,
        fps: u32,
    },
    MountImage {
        image: String,
    },
}

impl DeviceCommand {
    /// Name recorded in the audit log.
    pub fn action(&self) -> &'static str {
        match self {
            DeviceCommand::Power { action } => action.as_str(),
            DeviceCommand::Keyboard { .. } => "keyboard",
            DeviceCommand::Mouse { .. } => "mouse",
            DeviceCommand::Snapshot => "snapshot",
            DeviceCommand::ResetHid => "hid_reset",
            DeviceCommand::StreamerParams { .. } => "set_streamer_params",
            DeviceCommand::MountImage { .. } => "mount_image",
        }
    }

    /// Level the caller needs.  Looking at the screen is `View`; anything
    /// that changes the machine is `Control`.
    pub fn required_level(&self) -> PermissionLevel {
        match self {
            DeviceCommand::Snapshot => PermissionLevel::View,
            _ => PermissionLevel::Control,
        }
    }
}

/// Every long-lived component of a running gateway.
pub struct Gateway {
    pub registry: Arc<DeviceRegistry>,
    pub sessions: Arc<HardwareSessionManager>,
    pub streams: Arc<StreamOrchestrator>,
    /// Device event bus (`device_status`), one topic.
    pub events: Arc<ConnectionFanout>,
    /// Per-device stream events and frames.
    pub video: Arc<ConnectionFanout>,
    /// Per-device WebRTC signaling sockets.
    pub signaling: Arc<ConnectionFanout>,
    /// Per-room presence.
    pub rooms: Arc<ConnectionFanout>,
    permissions: Arc<dyn PermissionGate>,
    audit: Arc<dyn AuditSink>,
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        transports: Arc<dyn TransportFactory>,
        permissions: Arc<dyn PermissionGate>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let probe = ProbeTimeouts {
            primary: config.timeouts.auth_check(),
            capability: config.timeouts.capability_probe(),
            details: config.timeouts.command(),
        };
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&transports), probe));
        let sessions = Arc::new(HardwareSessionManager::new(
            Arc::clone(&registry),
            transports,
            SessionTimeouts::from(&config.timeouts),
        ));
        let video = Arc::new(ConnectionFanout::new("video"));
        let streams = Arc::new(StreamOrchestrator::new(
            Arc::clone(&sessions),
            Arc::clone(&video),
            StreamTimings::from(&config.streaming),
        ));

        Arc::new(Self {
            registry,
            sessions,
            streams,
            events: Arc::new(ConnectionFanout::new("events")),
            video,
            signaling: Arc::new(ConnectionFanout::new("signaling")),
            rooms: Arc::new(ConnectionFanout::new("rooms")),
            permissions,
            audit,
        })
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    /// Probes and registers a unit.  Re-registering an id replaces its
    /// entry and drops the old session so the next command logs in again.
    pub async fn register_device(&self, config: DeviceConfig) -> bool {
        let id = config.id.clone();
        if !self.registry.add_device(config).await {
            return false;
        }
        self.sessions.drop_session(&id).await;
        if let Some(device) = self.registry.get(&id).await {
            self.publish_status(DeviceStatusReport::from_device(&device)).await;
        }
        true
    }

    /// Stops the unit's streams, closes its sockets and session, then
    /// forgets it.  Returns `false` for an unknown id.
    pub async fn deregister_device(&self, device_id: &str) -> bool {
        self.streams.stop_stream(device_id, None).await;
        self.signaling.close_topic(device_id).await;
        self.video.close_topic(device_id).await;
        self.sessions.drop_session(device_id).await;
        let removed = self.registry.remove_device(device_id).await;
        if removed {
            info!("device {device_id} deregistered");
        }
        removed
    }

    /// Publishes one report on the device event bus.
    pub async fn publish_status(&self, report: DeviceStatusReport) -> BroadcastReport {
        self.events
            .broadcast(DEVICE_EVENTS_TOPIC, &GatewayEvent::DeviceStatus { report })
            .await
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    pub fn has_permission(&self, user: &str, device_id: &str, level: PermissionLevel) -> bool {
        self.permissions.has_permission(user, device_id, level)
    }

    /// Records an operator action without waiting for the sink.
    pub fn audit(&self, user: &str, action: &str, device_id: &str, details: Value) {
        let sink = Arc::clone(&self.audit);
        let (user, action, device_id) = (user.to_string(), action.to_string(), device_id.to_string());
        tokio::spawn(async move {
            sink.log_action(&user, &action, &device_id, details).await;
        });
    }

    /// Runs one hardware command on behalf of `user`.
    ///
    /// A missing permission is reported as an `auth` failure without
    /// touching the unit.  Every permitted command is audited.
    pub async fn execute(&self, user: &str, device_id: &str, command: DeviceCommand) -> CommandResult {
        let action = command.action();
        let level = command.required_level();
        if !self.has_permission(user, device_id, level) {
            warn!("{user}: {action} on {device_id} denied (needs {})", level.as_str());
            let err = GatewayError::Auth(format!("{user} lacks {} permission", level.as_str()));
            return CommandResult::err(action, device_id, &err);
        }
        self.audit(user, action, device_id, serde_json::to_value(&command).unwrap_or(Value::Null));

        let sessions = &self.sessions;
        match command {
            DeviceCommand::Power { action } => sessions.power_action(device_id, action).await,
            DeviceCommand::Keyboard { keys, modifiers } => {
                as_value(sessions.send_keyboard_input(device_id, &keys, &modifiers).await)
            }
            DeviceCommand::Mouse { x, y, buttons, scroll } => {
                sessions.send_mouse_input(device_id, x, y, &buttons, scroll).await
            }
            DeviceCommand::Snapshot => as_value(sessions.get_video_snapshot(device_id).await),
            DeviceCommand::ResetHid => sessions.reset_hid(device_id).await,
            DeviceCommand::StreamerParams { quality, fps } => {
                sessions.set_streamer_params(device_id, quality, fps).await
            }
            DeviceCommand::MountImage { image } => sessions.mount_image(device_id, &image).await,
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Stops every stream, closes every socket and session.  Idempotent.
    pub async fn shutdown(&self) {
        self.streams.cleanup().await;
        let closed = self.events.close_all().await
            + self.signaling.close_all().await
            + self.video.close_all().await
            + self.rooms.close_all().await;
        self.sessions.cleanup().await;
        self.registry.close().await;
        info!("gateway shut down ({closed} socket(s) closed)");
    }
}

/// Re-types a result's payload as JSON.
fn as_value<T: Serialize>(result: CommandResult<T>) -> CommandResult {
    CommandResult {
        success: result.success,
        action: result.action,
        device_id: result.device_id,
        data: result.data.map(|d| {
            serde_json::to_value(d).unwrap_or_else(|e| json!({ "encode_error": e.to_string() }))
        }),
        error: result.error,
        timestamp: result.timestamp,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::collaborators::{MockPermissionGate, TracingAuditSink, TrustedUpstreamGate};
    use crate::infrastructure::mock::{MockDevice, MockTransportFactory, RecordingAuditSink, RecordingSubscriber};
    use kvm_core::protocol::native::{ATX_PATH, SNAPSHOT_PATH};
    use kvm_core::{ErrorKind, StreamConfig};
    use mockall::predicate::{always, eq};

    fn device(id: &str, host: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            name: String::new(),
            host: host.to_string(),
            port: 80,
            scheme: Default::default(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }

    fn gateway_with(factory: &MockTransportFactory, gate: Arc<dyn PermissionGate>) -> Arc<Gateway> {
        Gateway::new(
            &GatewayConfig::default(),
            Arc::new(factory.clone()),
            gate,
            Arc::new(TracingAuditSink),
        )
    }

    #[tokio::test]
    async fn test_register_publishes_status_on_event_bus() {
        // Arrange
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let gateway = gateway_with(&factory, Arc::new(TrustedUpstreamGate));
        let watcher = RecordingSubscriber::new();
        gateway.events.add_subscriber(DEVICE_EVENTS_TOPIC, watcher.clone()).await;

        // Act
        let ok = gateway.register_device(device("d1", "h")).await;

        // Assert
        assert!(ok);
        assert_eq!(watcher.event_types(), vec!["device_status"]);
    }

    #[tokio::test]
    async fn test_unreachable_device_is_not_registered() {
        let factory = MockTransportFactory::new().with_device("h", MockDevice::unreachable());
        let gateway = gateway_with(&factory, Arc::new(TrustedUpstreamGate));

        assert!(!gateway.register_device(device("d1", "h")).await);
        assert!(gateway.registry.get("d1").await.is_none());
    }

    #[tokio::test]
    async fn test_denied_command_never_reaches_the_unit() {
        // Arrange
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let mut gate = MockPermissionGate::new();
        gate.expect_has_permission()
            .with(eq("bob"), eq("d1"), eq(PermissionLevel::Control))
            .return_const(false);
        let gateway = gateway_with(&factory, Arc::new(gate));
        gateway.registry.add_device(device("d1", "h")).await;
        factory.clear_requests();

        // Act
        let result = gateway
            .execute("bob", "d1", DeviceCommand::Power { action: PowerAction::PowerOff })
            .await;

        // Assert
        assert_eq!(result.error_kind(), Some(ErrorKind::Auth));
        assert!(factory.requests_to(ATX_PATH).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_needs_only_view() {
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let mut gate = MockPermissionGate::new();
        gate.expect_has_permission()
            .with(always(), always(), eq(PermissionLevel::View))
            .times(1)
            .return_const(true);
        let gateway = gateway_with(&factory, Arc::new(gate));
        gateway.registry.add_device(device("d1", "h")).await;

        let result = gateway.execute("viewer", "d1", DeviceCommand::Snapshot).await;

        assert!(result.success, "{:?}", result.error);
        assert!(result.data.unwrap()["image_data"].is_string());
        assert_eq!(factory.requests_to(SNAPSHOT_PATH).len(), 1);
    }

    #[tokio::test]
    async fn test_permitted_command_is_audited() {
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let audit = RecordingAuditSink::new();
        let gateway = Gateway::new(
            &GatewayConfig::default(),
            Arc::new(factory.clone()),
            Arc::new(TrustedUpstreamGate),
            audit.clone(),
        );
        gateway.registry.add_device(device("d1", "h")).await;

        gateway
            .execute("alice", "d1", DeviceCommand::Power { action: PowerAction::Restart })
            .await;
        let entries = audit.wait_for(1).await;

        assert_eq!(entries[0].user, "alice");
        assert_eq!(entries[0].action, "restart");
        assert_eq!(entries[0].device_id, "d1");
    }

    #[tokio::test]
    async fn test_command_json_shape() {
        let cmd: DeviceCommand =
            serde_json::from_str(r#"{"type":"keyboard","keys":["ctrl+alt+del"]}"#).unwrap();
        assert_eq!(
            cmd,
            DeviceCommand::Keyboard { keys: vec!["ctrl+alt+del".into()], modifiers: vec![] }
        );
        let power: DeviceCommand =
            serde_json::from_str(r#"{"type":"power","action":"power_on"}"#).unwrap();
        assert_eq!(power.action(), "power_on");
    }

    #[tokio::test]
    async fn test_deregister_stops_streams_and_sessions() {
        // Arrange
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let gateway = gateway_with(&factory, Arc::new(TrustedUpstreamGate));
        gateway.register_device(device("d1", "h")).await;
        gateway.sessions.authenticate_device("d1").await;
        let viewer = RecordingSubscriber::new();
        gateway.streams.add_viewer("d1", viewer.clone()).await;
        gateway.streams.start_stream(StreamConfig::new("d1")).await;

        // Act
        let removed = gateway.deregister_device("d1").await;

        // Assert
        assert!(removed);
        assert!(viewer.is_closed());
        assert_eq!(gateway.streams.running_tasks().await, 0);
        assert_eq!(gateway.sessions.session_count().await, 0);
        assert!(!gateway.deregister_device("d1").await);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let gateway = gateway_with(&factory, Arc::new(TrustedUpstreamGate));
        gateway.register_device(device("d1", "h")).await;
        let watcher = RecordingSubscriber::new();
        gateway.events.add_subscriber(DEVICE_EVENTS_TOPIC, watcher.clone()).await;

        gateway.shutdown().await;
        gateway.shutdown().await;

        assert!(watcher.is_closed());
        assert_eq!(gateway.sessions.session_count().await, 0);
    }
}
