//! Realtime channels: what happens on each kind of viewer socket.
//!
//! # Channels
//!
//! | Path                  | Joins                         | Needs   |
//! |-----------------------|-------------------------------|---------|
//! | `/webrtc/{device_id}` | signaling + video topic       | view    |
//! | `/stream/{device_id}` | video topic                   | control |
//! | `/events`             | device event bus              | view    |
//! | `/rooms/{room_id}`    | room presence topic           | (none)  |
//!
//! Every path may carry an `/api` prefix.  The transport (see
//! `infrastructure::ws_server`) owns the socket; this module only decides
//! what to join, what to answer and what to leave.  A malformed frame gets
//! a personal `error` event and the channel stays open.

use std::fmt;
use std::sync::Arc;

use kvm_core::protocol::messages::{SignalingRequest, StreamControlRequest};
use kvm_core::{DeviceStatusReport, GatewayEvent, StreamQuality};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::collaborators::PermissionLevel;
use super::fanout::{ConnectionFanout, Subscriber};
use super::gateway::{Gateway, DEVICE_EVENTS_TOPIC};

/// Which channel a socket asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRoute {
    Signaling { device_id: String },
    StreamControl { device_id: String },
    Events,
    Room { room_id: String },
}

impl ChannelRoute {
    /// Parses a request path such as `/api/webrtc/rack-3?token=x`.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or_default();
        let path = path.strip_prefix("/api").unwrap_or(path);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match segments.as_slice() {
            ["webrtc", id] if !id.is_empty() => Some(ChannelRoute::Signaling {
                device_id: id.to_string(),
            }),
            ["stream", id] if !id.is_empty() => Some(ChannelRoute::StreamControl {
                device_id: id.to_string(),
            }),
            ["events"] => Some(ChannelRoute::Events),
            ["rooms", id] if !id.is_empty() => Some(ChannelRoute::Room {
                room_id: id.to_string(),
            }),
            _ => None,
        }
    }

    /// Level needed to join and the target it is checked against.
    fn requirement(&self) -> Option<(&str, PermissionLevel)> {
        match self {
            ChannelRoute::Signaling { device_id } => {
                Some((device_id.as_str(), PermissionLevel::View))
            }
            ChannelRoute::StreamControl { device_id } => {
                Some((device_id.as_str(), PermissionLevel::Control))
            }
            ChannelRoute::Events => Some(("*", PermissionLevel::View)),
            ChannelRoute::Room { .. } => None,
        }
    }

    /// Asks the permission gate whether `user` may join this route.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Forbidden`] when the gate says no.
    pub fn authorize(&self, gateway: &Gateway, user: &str) -> Result<(), ChannelError> {
        match self.requirement() {
            Some((target, level)) if !gateway.has_permission(user, target, level) => {
                warn!("{user}: {self} refused (needs {})", level.as_str());
                Err(ChannelError::Forbidden {
                    user: user.to_string(),
                    route: self.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn device_id(&self) -> Option<&str> {
        match self {
            ChannelRoute::Signaling { device_id } | ChannelRoute::StreamControl { device_id } => {
                Some(device_id.as_str())
            }
            _ => None,
        }
    }
}

impl fmt::Display for ChannelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRoute::Signaling { device_id } => write!(f, "/webrtc/{device_id}"),
            ChannelRoute::StreamControl { device_id } => write!(f, "/stream/{device_id}"),
            ChannelRoute::Events => f.write_str("/events"),
            ChannelRoute::Room { room_id } => write!(f, "/rooms/{room_id}"),
        }
    }
}

/// Why a channel could not be opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{user} may not open {route}")]
    Forbidden { user: String, route: String },
}

impl ChannelError {
    /// HTTP status used to reject the upgrade.
    pub fn http_status(&self) -> u16 {
        match self {
            ChannelError::NotFound(_) => 404,
            ChannelError::Forbidden { .. } => 403,
        }
    }
}

/// One open viewer socket bound to its route.
pub struct RealtimeChannel {
    gateway: Arc<Gateway>,
    route: ChannelRoute,
    user: String,
    socket: Arc<dyn Subscriber>,
}

impl RealtimeChannel {
    /// Authorizes `user`, joins the route's topics and sends the greeting.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Forbidden`] when the permission gate says no;
    /// [`ChannelError::NotFound`] when the device is not registered.
    pub async fn open(
        gateway: Arc<Gateway>,
        route: ChannelRoute,
        user: &str,
        socket: Arc<dyn Subscriber>,
    ) -> Result<Self, ChannelError> {
        route.authorize(&gateway, user)?;
        if let Some(device_id) = route.device_id() {
            if gateway.registry.get(device_id).await.is_none() {
                return Err(ChannelError::NotFound(format!("device {device_id}")));
            }
        }

        let channel = Self {
            gateway,
            route,
            user: user.to_string(),
            socket,
        };
        channel.join().await;
        info!("{} opened {}", channel.user, channel.route);
        Ok(channel)
    }

    pub fn route(&self) -> &ChannelRoute {
        &self.route
    }

    async fn join(&self) {
        let gw = &self.gateway;
        let socket = Arc::clone(&self.socket);
        match &self.route {
            ChannelRoute::Signaling { device_id } => {
                gw.signaling.add_subscriber(device_id, Arc::clone(&socket)).await;
                gw.streams.add_viewer(device_id, socket).await;
                self.reply(GatewayEvent::webrtc_init(device_id.as_str())).await;
            }
            ChannelRoute::StreamControl { device_id } => {
                gw.streams.add_viewer(device_id, socket).await;
            }
            ChannelRoute::Events => {
                gw.events.add_subscriber(DEVICE_EVENTS_TOPIC, socket).await;
                for device in gw.registry.list().await {
                    let report = DeviceStatusReport::from_device(&device);
                    if !self.reply(GatewayEvent::DeviceStatus { report }).await {
                        break;
                    }
                }
            }
            ChannelRoute::Room { room_id } => {
                let members = gw.rooms.add_subscriber(room_id, socket).await;
                self.announce_presence(room_id, true, members).await;
            }
        }
    }

    /// Leaves every topic this channel joined.  Idempotent.
    pub async fn close(&self) {
        let gw = &self.gateway;
        let id = self.socket.id();
        match &self.route {
            ChannelRoute::Signaling { device_id } => {
                gw.signaling.remove_subscriber(device_id, id).await;
                gw.streams.remove_viewer(device_id, id).await;
            }
            ChannelRoute::StreamControl { device_id } => {
                gw.streams.remove_viewer(device_id, id).await;
            }
            ChannelRoute::Events => {
                gw.events.remove_subscriber(DEVICE_EVENTS_TOPIC, id).await;
            }
            ChannelRoute::Room { room_id } => {
                if gw.rooms.remove_subscriber(room_id, id).await {
                    let members = gw.rooms.subscriber_count(room_id).await;
                    self.announce_presence(room_id, false, members).await;
                }
            }
        }
        debug!("{} left {}", self.user, self.route);
    }

    /// Handles one text frame from the socket.
    pub async fn handle_text(&self, text: &str) {
        match &self.route {
            ChannelRoute::Signaling { device_id } => self.on_signaling(device_id, text).await,
            ChannelRoute::StreamControl { device_id } => {
                self.on_stream_control(device_id, text).await
            }
            ChannelRoute::Events | ChannelRoute::Room { .. } => {
                self.reply(GatewayEvent::error("this channel does not accept messages"))
                    .await;
            }
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    async fn on_signaling(&self, device_id: &str, text: &str) {
        let request: SignalingRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                self.reply(GatewayEvent::error(format!("invalid message: {e}"))).await;
                return;
            }
        };

        match request {
            SignalingRequest::Offer { .. } => {
                self.gateway.audit(&self.user, "webrtc_offer", device_id, json!({}));
                self.reply(GatewayEvent::answer(device_id)).await;
            }
            SignalingRequest::IceCandidate { candidate } => {
                self.reply(GatewayEvent::IceCandidateAck {
                    device_id: device_id.to_string(),
                    candidate,
                })
                .await;
            }
            SignalingRequest::QualityChange { quality } => {
                self.change_quality(device_id, quality).await;
            }
        }
    }

    async fn on_stream_control(&self, device_id: &str, text: &str) {
        let request: StreamControlRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                self.reply(GatewayEvent::error(format!("invalid message: {e}"))).await;
                return;
            }
        };

        if let Some(config) = request.start_config(device_id) {
            self.gateway.audit(
                &self.user,
                "start_stream",
                device_id,
                json!({ "stream_type": config.stream_type, "quality": config.quality }),
            );
            let stream = self.gateway.streams.start_stream(config).await;
            self.reply(GatewayEvent::StreamStarted {
                device_id: device_id.to_string(),
                stream,
            })
            .await;
            return;
        }

        match request {
            StreamControlRequest::StopStream { stream_type } => {
                self.gateway.audit(
                    &self.user,
                    "stop_stream",
                    device_id,
                    json!({ "stream_type": stream_type }),
                );
                let stopped = self.gateway.streams.stop_stream(device_id, stream_type).await;
                // A non-empty stop was already broadcast to every viewer,
                // this socket included.
                if stopped.is_empty() {
                    self.reply(GatewayEvent::StreamStopped {
                        device_id: device_id.to_string(),
                        stopped_streams: stopped,
                    })
                    .await;
                }
            }
            StreamControlRequest::QualityChange { quality } => {
                self.change_quality(device_id, quality).await;
            }
            StreamControlRequest::StartStream { .. } => {}
        }
    }

    async fn change_quality(&self, device_id: &str, quality: StreamQuality) {
        self.gateway.audit(
            &self.user,
            "quality_change",
            device_id,
            json!({ "quality": quality }),
        );
        if let Err(e) = self
            .gateway
            .streams
            .change_stream_quality(device_id, quality)
            .await
        {
            self.reply(GatewayEvent::error(e.to_string())).await;
        }
    }

    async fn announce_presence(&self, room_id: &str, joined: bool, members: usize) {
        let event = GatewayEvent::RoomPresence {
            room_id: room_id.to_string(),
            user: self.user.clone(),
            joined,
            members,
        };
        self.gateway.rooms.broadcast(room_id, &event).await;
    }

    /// Sends `event` to this socket only.
    async fn reply(&self, event: GatewayEvent) -> bool {
        self.fanout().send_personal(&self.socket, &event).await
    }

    fn fanout(&self) -> &ConnectionFanout {
        match &self.route {
            ChannelRoute::Signaling { .. } => &self.gateway.signaling,
            ChannelRoute::StreamControl { .. } => &self.gateway.video,
            ChannelRoute::Events => &self.gateway.events,
            ChannelRoute::Room { .. } => &self.gateway.rooms,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::collaborators::{MockPermissionGate, PermissionGate, TrustedUpstreamGate};
    use crate::domain::config::GatewayConfig;
    use crate::infrastructure::mock::{
        MockDevice, MockTransportFactory, RecordingAuditSink, RecordingSubscriber,
    };
    use kvm_core::{DeviceConfig, StreamType};

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            name: String::new(),
            host: "h".to_string(),
            port: 80,
            scheme: Default::default(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }

    async fn gateway(gate: Arc<dyn PermissionGate>, audit: Arc<RecordingAuditSink>) -> Arc<Gateway> {
        let factory = MockTransportFactory::new().with_device("h", MockDevice::pikvm());
        let gateway = Gateway::new(&GatewayConfig::default(), Arc::new(factory), gate, audit);
        assert!(gateway.register_device(device("d1")).await);
        gateway
    }

    async fn open(
        gw: &Arc<Gateway>,
        path: &str,
        user: &str,
    ) -> (Result<RealtimeChannel, ChannelError>, Arc<RecordingSubscriber>) {
        let socket = RecordingSubscriber::new();
        let route = ChannelRoute::parse(path).unwrap();
        let channel = RealtimeChannel::open(Arc::clone(gw), route, user, socket.clone()).await;
        (channel, socket)
    }

    // ── Routes ────────────────────────────────────────────────────────────────

    #[test]
    fn test_route_parsing() {
        assert_eq!(
            ChannelRoute::parse("/api/webrtc/rack-3?token=x"),
            Some(ChannelRoute::Signaling { device_id: "rack-3".into() })
        );
        assert_eq!(
            ChannelRoute::parse("/stream/d1"),
            Some(ChannelRoute::StreamControl { device_id: "d1".into() })
        );
        assert_eq!(ChannelRoute::parse("/events"), Some(ChannelRoute::Events));
        assert_eq!(
            ChannelRoute::parse("/rooms/ops"),
            Some(ChannelRoute::Room { room_id: "ops".into() })
        );
        assert_eq!(ChannelRoute::parse("/webrtc/"), None);
        assert_eq!(ChannelRoute::parse("/chat/ops"), None);
    }

    // ── Signaling ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_signaling_greets_answers_and_acks() {
        // Arrange
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;
        let (channel, socket) = open(&gw, "/webrtc/d1", "alice").await;
        let channel = channel.unwrap();

        // Act
        channel.handle_text(r#"{"type":"offer","sdp":{"type":"offer","sdp":"v=0"}}"#).await;
        channel
            .handle_text(r#"{"type":"ice_candidate","candidate":{"candidate":"c1"}}"#)
            .await;

        // Assert
        assert_eq!(socket.event_types(), vec!["webrtc_init", "answer", "ice_candidate_ack"]);
        match &socket.events()[2] {
            GatewayEvent::IceCandidateAck { candidate, .. } => assert_eq!(candidate["candidate"], "c1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_and_channel_stays_open() {
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;
        let (channel, socket) = open(&gw, "/webrtc/d1", "alice").await;
        let channel = channel.unwrap();

        channel.handle_text("{not json").await;
        channel.handle_text(r#"{"type":"offer"}"#).await;

        assert_eq!(socket.event_types(), vec!["webrtc_init", "error", "answer"]);
        assert_eq!(gw.signaling.subscriber_count("d1").await, 1);
    }

    #[tokio::test]
    async fn test_quality_change_without_stream_replies_error() {
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;
        let (channel, socket) = open(&gw, "/webrtc/d1", "alice").await;

        channel
            .unwrap()
            .handle_text(r#"{"type":"quality_change","quality":"high"}"#)
            .await;

        assert_eq!(socket.event_types(), vec!["webrtc_init", "error"]);
    }

    #[tokio::test]
    async fn test_close_leaves_every_topic() {
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;
        let (channel, _socket) = open(&gw, "/webrtc/d1", "alice").await;
        let channel = channel.unwrap();

        channel.close().await;
        channel.close().await;

        assert_eq!(gw.signaling.subscriber_count("d1").await, 0);
        assert_eq!(gw.video.subscriber_count("d1").await, 0);
    }

    // ── Access ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stream_control_needs_control_level() {
        // Arrange
        let mut gate = MockPermissionGate::new();
        gate.expect_has_permission()
            .returning(|_, _, level| level == PermissionLevel::View);
        let gw = gateway(Arc::new(gate), RecordingAuditSink::new()).await;

        // Act
        let (control, socket) = open(&gw, "/stream/d1", "viewer").await;
        let (signaling, _) = open(&gw, "/webrtc/d1", "viewer").await;

        // Assert
        let err = control.err().unwrap();
        assert_eq!(err.http_status(), 403);
        assert!(socket.event_types().is_empty());
        assert!(signaling.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;

        let (channel, _) = open(&gw, "/stream/ghost", "alice").await;

        assert_eq!(channel.err().map(|e| e.http_status()), Some(404));
    }

    // ── Stream control ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_stop_round() {
        // Arrange
        let audit = RecordingAuditSink::new();
        let gw = gateway(Arc::new(TrustedUpstreamGate), audit.clone()).await;
        let (channel, socket) = open(&gw, "/stream/d1", "alice").await;
        let channel = channel.unwrap();
        let start = r#"{"type":"start_stream","stream_type":"h264","quality":"high"}"#;

        // Act
        channel.handle_text(start).await;
        channel.handle_text(start).await;
        channel.handle_text(r#"{"type":"stop_stream"}"#).await;

        // Assert
        let started: Vec<bool> = socket
            .events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::StreamStarted { stream, .. } => Some(stream.already_active),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![false, true]);
        let stopped = socket.events().into_iter().find_map(|e| match e {
            GatewayEvent::StreamStopped { stopped_streams, .. } => Some(stopped_streams),
            _ => None,
        });
        assert_eq!(stopped, Some(vec![StreamType::H264]));
        assert!(socket.is_closed());
        assert_eq!(gw.streams.running_tasks().await, 0);

        let actions: Vec<String> = audit.wait_for(3).await.into_iter().map(|e| e.action).collect();
        assert_eq!(actions.iter().filter(|a| *a == "start_stream").count(), 2);
        assert!(actions.contains(&"stop_stream".to_string()));
    }

    #[tokio::test]
    async fn test_stop_with_nothing_running_replies_empty() {
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;
        let (channel, socket) = open(&gw, "/stream/d1", "alice").await;

        channel.unwrap().handle_text(r#"{"type":"stop_stream","stream_type":"mjpeg"}"#).await;

        assert_eq!(
            socket.events(),
            vec![GatewayEvent::StreamStopped { device_id: "d1".into(), stopped_streams: vec![] }]
        );
        assert!(!socket.is_closed());
    }

    // ── Events and rooms ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_events_channel_sends_current_status() {
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;

        let (channel, socket) = open(&gw, "/events", "alice").await;
        channel.unwrap().handle_text("hello").await;

        assert_eq!(socket.event_types(), vec!["device_status", "error"]);
    }

    #[tokio::test]
    async fn test_room_presence() {
        // Arrange
        let gw = gateway(Arc::new(TrustedUpstreamGate), RecordingAuditSink::new()).await;
        let (first, first_socket) = open(&gw, "/rooms/ops", "alice").await;
        let _first = first.unwrap();

        // Act
        let (second, _second_socket) = open(&gw, "/rooms/ops", "bob").await;
        second.unwrap().close().await;

        // Assert
        let presence: Vec<(String, bool, usize)> = first_socket
            .events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::RoomPresence { user, joined, members, .. } => {
                    Some((user, joined, members))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            presence,
            vec![
                ("alice".to_string(), true, 1),
                ("bob".to_string(), true, 2),
                ("bob".to_string(), false, 1),
            ]
        );
    }
}
