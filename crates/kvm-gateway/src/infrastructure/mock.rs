//! In-memory units and sockets for testing.
//!
//! # Why mock units?
//!
//! The real transport talks HTTP to physical KVM hardware that:
//!
//! - Is rarely available on a CI machine.
//! - Actually powers servers on and off.
//! - Cannot be made to fail on demand.
//!
//! [`MockTransportFactory`] replaces the network with a table of
//! [`MockDevice`]s keyed by host.  Every request is recorded so tests can
//! inspect exactly what was sent and in what order, and each unit can be
//! configured to lack a capability, return a token, fail once, or be
//! unreachable.
//!
//! [`RecordingSubscriber`] plays the same role for viewer sockets: it keeps
//! every text frame it was sent and can be told to start failing.
//! [`RecordingAuditSink`] keeps every audit record.
//!
//! # Usage in tests
//!
//! ```ignore
//! let factory = MockTransportFactory::new()
//!     .with_device("10.0.0.1", MockDevice::pikvm().without(Capability::MassStorage));
//! let gateway = Gateway::new(&GatewayConfig::default(), Arc::new(factory.clone()), ...);
//!
//! gateway.sessions.power_action("d1", PowerAction::PowerOn).await;
//!
//! assert_eq!(factory.requests_to("/api/atx").len(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kvm_core::protocol::native::{capability_probe_path, LOGIN_PATH, SNAPSHOT_PATH};
use kvm_core::{Capability, DeviceConfig, GatewayError, GatewayEvent};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::application::collaborators::AuditSink;
use crate::application::fanout::{FanoutError, Subscriber};
use crate::application::transport::{
    Authorization, DeviceRequest, DeviceResponse, DeviceTransport, Method, TransportFactory,
};

/// Bytes returned by a mock snapshot.
pub const MOCK_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, b'J', b'F', b'I', b'F'];

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Mock units ────────────────────────────────────────────────────────────────

/// Behaviour of one simulated unit.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    token: Option<String>,
    missing: HashSet<&'static str>,
    replies: HashMap<(Method, String), DeviceResponse>,
    once: HashMap<(Method, String), VecDeque<DeviceResponse>>,
    unreachable: bool,
    latency: Duration,
}

impl MockDevice {
    /// A unit with every capability that answers `200 {"ok":true}`.
    ///
    /// Login succeeds without a token (basic-auth-only mode).
    pub fn pikvm() -> Self {
        Self::default()
    }

    /// A unit that refuses every connection.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Login returns `{"access_token": token}`.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// The probe endpoint of `capability` answers 404.
    pub fn without(mut self, capability: Capability) -> Self {
        self.missing.insert(capability_probe_path(capability));
        self
    }

    /// Every `method` request to `path` answers `status` with `body`.
    ///
    /// Requests with another method keep their normal reply, so a POST
    /// override never touches the GET capability probe of the same path.
    pub fn with_reply(mut self, method: Method, path: &str, status: u16, body: &str) -> Self {
        self.replies
            .insert((method, path.to_string()), text_response(status, body));
        self
    }

    /// The next `method` request to `path` answers `status`; later ones
    /// fall back to the normal reply.  Calls queue up in order.
    pub fn with_reply_once(mut self, method: Method, path: &str, status: u16, body: &str) -> Self {
        self.once
            .entry((method, path.to_string()))
            .or_default()
            .push_back(text_response(status, body));
        self
    }

    /// Every request sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn respond(&mut self, method: Method, path: &str) -> DeviceResponse {
        let key = (method, path.to_string());
        if let Some(queue) = self.once.get_mut(&key) {
            if let Some(reply) = queue.pop_front() {
                return reply;
            }
        }
        if let Some(reply) = self.replies.get(&key) {
            return reply.clone();
        }
        if self.missing.contains(path) {
            return text_response(404, "not found");
        }
        if path == LOGIN_PATH {
            let body = match &self.token {
                Some(t) => json!({ "access_token": t }),
                None => json!({ "ok": true }),
            };
            return json_response(200, &body);
        }
        if path == SNAPSHOT_PATH {
            return DeviceResponse {
                status: 200,
                content_type: Some("image/jpeg".to_string()),
                body: MOCK_JPEG.to_vec(),
            };
        }
        json_response(200, &json!({ "ok": true }))
    }
}

fn text_response(status: u16, body: &str) -> DeviceResponse {
    DeviceResponse {
        status,
        content_type: None,
        body: body.as_bytes().to_vec(),
    }
}

fn json_response(status: u16, body: &Value) -> DeviceResponse {
    DeviceResponse {
        status,
        content_type: Some("application/json".to_string()),
        body: body.to_string().into_bytes(),
    }
}

/// One request as seen by a mock unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub host: String,
    pub method: Method,
    pub path: String,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
    pub auth: Authorization,
}

#[derive(Default)]
struct MockState {
    devices: Mutex<HashMap<String, MockDevice>>,
    log: Mutex<Vec<RecordedRequest>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Transport factory backed by in-memory units.
///
/// Cloning shares the same units and request log, so a test can keep one
/// handle for assertions while the gateway owns another.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    state: Arc<MockState>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the unit answering for `host`.
    pub fn with_device(self, host: &str, device: MockDevice) -> Self {
        self.set_device(host, device);
        self
    }

    /// Replaces the unit answering for `host` at runtime.
    pub fn set_device(&self, host: &str, device: MockDevice) {
        lock(&self.state.devices).insert(host.to_string(), device);
    }

    /// Every request recorded so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state.log).clone()
    }

    /// Recorded requests whose path equals `path`.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    pub fn clear_requests(&self) {
        lock(&self.state.log).clear();
    }

    /// Number of transports opened.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Number of transports closed.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn open(&self, device: &DeviceConfig) -> Result<Arc<dyn DeviceTransport>, GatewayError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport {
            host: device.host.clone(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockTransport {
    host: String,
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn execute(&self, request: DeviceRequest) -> Result<DeviceResponse, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Connectivity("transport closed".to_string()));
        }

        let latency = lock(&self.state.devices)
            .get(&self.host)
            .map(|d| d.latency)
            .unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        lock(&self.state.log).push(RecordedRequest {
            host: self.host.clone(),
            method: request.method,
            path: request.path.to_string(),
            query: request.query.clone(),
            body: request.body.clone(),
            auth: request.auth.clone(),
        });

        // Unknown hosts behave like a refused connection.
        let mut devices = lock(&self.state.devices);
        match devices.get_mut(&self.host) {
            Some(device) if !device.unreachable => Ok(device.respond(request.method, request.path)),
            _ => Err(GatewayError::Connectivity(format!(
                "connection refused: {}",
                self.host
            ))),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Recording subscriber ──────────────────────────────────────────────────────

/// A viewer socket that records every frame it receives.
///
/// Set `failing` to make every later send return an error, simulating a
/// dropped connection.
pub struct RecordingSubscriber {
    id: Uuid,
    /// Every text frame delivered, in order.
    pub messages: Mutex<Vec<String>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            messages: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delivered frames parsed back into events; unparseable frames are skipped.
    pub fn events(&self) -> Vec<GatewayEvent> {
        lock(&self.messages)
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    /// `"type"` tags of every delivered frame.
    pub fn event_types(&self) -> Vec<String> {
        lock(&self.messages)
            .iter()
            .filter_map(|m| serde_json::from_str::<Value>(m).ok())
            .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send_text(&self, text: &str) -> Result<(), FanoutError> {
        if self.failing.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(FanoutError::SendFailed("mock failure".to_string()));
        }
        lock(&self.messages).push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Recording audit sink ──────────────────────────────────────────────────────

/// One audit record as received by [`RecordingAuditSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub user: String,
    pub action: String,
    pub device_id: String,
    pub details: Value,
}

/// Audit sink that keeps every record in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }

    /// Waits (up to one second) until at least `count` records arrived.
    ///
    /// Audit calls are spawned, so they land shortly after the command
    /// returns.
    pub async fn wait_for(&self, count: usize) -> Vec<AuditEntry> {
        for _ in 0..100 {
            if lock(&self.entries).len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.entries()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn log_action(&self, user_id: &str, action: &str, device_id: &str, details: Value) {
        lock(&self.entries).push(AuditEntry {
            user: user_id.to_string(),
            action: action.to_string(),
            device_id: device_id.to_string(),
            details,
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_core::protocol::native::{ATX_PATH, MSD_PATH};

    fn config(host: &str) -> DeviceConfig {
        DeviceConfig {
            id: "d1".into(),
            name: String::new(),
            host: host.into(),
            port: 80,
            scheme: Default::default(),
            username: "admin".into(),
            password: "admin".into(),
        }
    }

    #[tokio::test]
    async fn test_missing_capability_answers_404() {
        let factory = MockTransportFactory::new()
            .with_device("h", MockDevice::pikvm().without(Capability::MassStorage));
        let transport = factory.open(&config("h")).unwrap();

        let msd = transport
            .execute(DeviceRequest::get(MSD_PATH, Duration::from_secs(1)))
            .await
            .unwrap();
        let atx = transport
            .execute(DeviceRequest::get(ATX_PATH, Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(msd.status, 404);
        assert_eq!(atx.status, 200);
    }

    #[tokio::test]
    async fn test_reply_once_is_consumed_in_order() {
        let factory = MockTransportFactory::new().with_device(
            "h",
            MockDevice::pikvm()
                .with_reply_once(Method::Post, ATX_PATH, 500, "a")
                .with_reply_once(Method::Post, ATX_PATH, 401, "b"),
        );
        let transport = factory.open(&config("h")).unwrap();
        let req = || DeviceRequest::post(ATX_PATH, json!({}), Duration::from_secs(1));

        assert_eq!(transport.execute(req()).await.unwrap().status, 500);
        assert_eq!(transport.execute(req()).await.unwrap().status, 401);
        assert_eq!(transport.execute(req()).await.unwrap().status, 200);
        assert_eq!(factory.requests_to(ATX_PATH).len(), 3);
    }

    #[tokio::test]
    async fn test_post_override_leaves_get_probe_alone() {
        // Arrange
        let factory = MockTransportFactory::new().with_device(
            "h",
            MockDevice::pikvm()
                .with_reply(Method::Post, ATX_PATH, 500, "boom")
                .with_reply_once(Method::Post, ATX_PATH, 401, "expired"),
        );
        let transport = factory.open(&config("h")).unwrap();
        let get = || DeviceRequest::get(ATX_PATH, Duration::from_secs(1));
        let post = || DeviceRequest::post(ATX_PATH, json!({}), Duration::from_secs(1));

        // Act
        let probe = transport.execute(get()).await.unwrap();
        let first = transport.execute(post()).await.unwrap();
        let second = transport.execute(post()).await.unwrap();

        // Assert
        assert_eq!(probe.status, 200);
        assert_eq!(first.status, 401);
        assert_eq!(second.status, 500);
    }

    #[tokio::test]
    async fn test_unknown_host_is_connectivity_error() {
        let factory = MockTransportFactory::new();
        let transport = factory.open(&config("nowhere")).unwrap();

        let err = transport
            .execute(DeviceRequest::get(ATX_PATH, Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), kvm_core::ErrorKind::Connectivity);
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let factory = MockTransportFactory::new();
        let transport = factory.open(&config("h")).unwrap();

        transport.close().await;
        transport.close().await;

        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn test_recording_subscriber_fails_on_demand() {
        let sub = RecordingSubscriber::new();
        sub.send_text("{\"type\":\"error\",\"message\":\"x\"}").await.unwrap();
        sub.set_failing(true);

        assert!(sub.send_text("second").await.is_err());
        assert_eq!(sub.event_types(), vec!["error".to_string()]);
    }
}
