//! Authenticated sessions and hardware command dispatch.
//!
//! # Sessions
//!
//! Each unit gets at most one live [`Session`]: a transport plus, when the
//! unit's login endpoint issued one, a cached bearer token.  Sessions are
//! created lazily by the first command.  When a bearer token is rejected
//! (401/403) the session is thrown away, a new one is opened, and the
//! request is retried exactly once.
//!
//! # Failure semantics
//!
//! Every public operation returns a [`CommandResult`].  Network failures,
//! timeouts, bad statuses and missing capabilities are all folded into the
//! record's `error` field; nothing propagates to the caller.
//!
//! # Input ordering
//!
//! Keyboard and mouse sequences to one unit hold that unit's input lock for
//! their whole duration, so two operators' chords are never interleaved.
//! The lock lives outside the session and survives re-authentication.
//! Power, snapshot and virtual-media calls do not take it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kvm_core::keymap::{dom_code, Chord, KeyStroke};
use kvm_core::protocol::native::{
    key_body, mouse_button_body, mouse_move_body, mouse_wheel_body, power_body,
    set_image_body, streamer_params_body, LoginResponse, ATX_PATH, DEFAULT_SNAPSHOT_CONTENT_TYPE,
    HID_RESET_PATH, LOGIN_PATH, MOUSE_BUTTON_PATH, MOUSE_MOVE_PATH, MOUSE_WHEEL_PATH,
    MSD_SET_IMAGE_PATH, SEND_KEY_PATH, SNAPSHOT_PATH, SNAPSHOT_QUERY, STREAMER_PARAMS_PATH,
};
use kvm_core::{
    Capability, CommandResult, DeviceConfig, DeviceId, GatewayError, PowerAction, Snapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use super::transport::{
    Authorization, DeviceRequest, DeviceResponse, DeviceTransport, TransportFactory,
};
use crate::domain::config::TimeoutSettings;

/// Per-call timeouts and the chord inter-event delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub login: Duration,
    pub command: Duration,
    pub snapshot: Duration,
    pub key_event_delay: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutSettings::default())
    }
}

impl From<&TimeoutSettings> for SessionTimeouts {
    fn from(t: &TimeoutSettings) -> Self {
        Self {
            login: t.login(),
            command: t.command(),
            snapshot: t.snapshot(),
            key_event_delay: t.key_event_delay(),
        }
    }
}

/// How a session authenticates its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Bearer,
    BasicOnly,
}

struct Session {
    transport: Arc<dyn DeviceTransport>,
    token: Option<String>,
}

impl Session {
    fn auth(&self) -> Authorization {
        match &self.token {
            Some(t) => Authorization::Bearer(t.clone()),
            None => Authorization::Basic,
        }
    }

    fn mode(&self) -> AuthMode {
        if self.token.is_some() {
            AuthMode::Bearer
        } else {
            AuthMode::BasicOnly
        }
    }
}

/// Owns one session per unit and dispatches hardware commands through it.
pub struct HardwareSessionManager {
    registry: Arc<DeviceRegistry>,
    transports: Arc<dyn TransportFactory>,
    sessions: RwLock<HashMap<DeviceId, Arc<Session>>>,
    input_locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    timeouts: SessionTimeouts,
}

impl HardwareSessionManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transports: Arc<dyn TransportFactory>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            registry,
            transports,
            sessions: RwLock::new(HashMap::new()),
            input_locks: Mutex::new(HashMap::new()),
            timeouts,
        }
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Opens (or reuses) the session for a unit and reports its auth mode.
    pub async fn authenticate_device(&self, device_id: &str) -> CommandResult<AuthMode> {
        let result = self.session(device_id).await.map(|s| s.mode());
        self.finish("authenticate", device_id, result)
    }

    /// Closes and forgets the session of one unit.  Idempotent.
    pub async fn drop_session(&self, device_id: &str) {
        let removed = self.sessions.write().await.remove(device_id);
        self.input_locks.lock().await.remove(device_id);
        if let Some(session) = removed {
            session.transport.close().await;
            debug!("device {device_id}: session closed");
        }
    }

    /// Closes every open session.  Idempotent.
    pub async fn cleanup(&self) {
        let drained: Vec<(DeviceId, Arc<Session>)> =
            self.sessions.write().await.drain().collect();
        self.input_locks.lock().await.clear();
        for (id, session) in &drained {
            session.transport.close().await;
            debug!("device {id}: session closed");
        }
        if !drained.is_empty() {
            info!("closed {} device session(s)", drained.len());
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Sends one ATX power action.
    pub async fn power_action(&self, device_id: &str, action: PowerAction) -> CommandResult {
        let result = async {
            self.require(device_id, Capability::PowerControl).await?;
            let request =
                DeviceRequest::post(ATX_PATH, power_body(action), self.timeouts.command);
            let resp = self.execute(device_id, request).await?;
            Ok(json!({
                "native_action": action.native_code(),
                "native_response": resp.json_or_text(),
            }))
        }
        .await;
        self.finish(action.as_str(), device_id, result)
    }

    /// Types a key or a chord.
    ///
    /// `keys` and `modifiers` may contain single names, `+`-joined
    /// combinations or named combinations (see [`Chord::build`]).  The data
    /// of a successful result is the chord in press order.
    pub async fn send_keyboard_input(
        &self,
        device_id: &str,
        keys: &[String],
        modifiers: &[String],
    ) -> CommandResult<Vec<String>> {
        let result = async {
            self.require(device_id, Capability::HidControl).await?;
            let chord = Chord::build(keys, modifiers);
            if chord.is_empty() {
                return Err(GatewayError::Protocol {
                    status: None,
                    message: "no keys given".to_string(),
                });
            }

            let lock = self.input_lock(device_id).await;
            let _held = lock.lock().await;
            self.play_chord(device_id, &chord).await?;
            Ok(chord.keys().to_vec())
        }
        .await;
        self.finish("keyboard", device_id, result)
    }

    /// Moves the cursor, clicks each button, then scrolls when `scroll != 0`.
    pub async fn send_mouse_input(
        &self,
        device_id: &str,
        x: i32,
        y: i32,
        buttons: &[String],
        scroll: i32,
    ) -> CommandResult {
        let result = async {
            self.require(device_id, Capability::HidControl).await?;
            let lock = self.input_lock(device_id).await;
            let _held = lock.lock().await;

            let cmd = self.timeouts.command;
            self.execute(device_id, DeviceRequest::post(MOUSE_MOVE_PATH, mouse_move_body(x, y), cmd))
                .await?;
            for button in buttons {
                for pressed in [true, false] {
                    let body = mouse_button_body(button, pressed);
                    self.execute(device_id, DeviceRequest::post(MOUSE_BUTTON_PATH, body, cmd))
                        .await?;
                }
            }
            if scroll != 0 {
                let body = mouse_wheel_body(scroll);
                self.execute(device_id, DeviceRequest::post(MOUSE_WHEEL_PATH, body, cmd))
                    .await?;
            }
            Ok(json!({ "x": x, "y": y, "buttons": buttons, "scroll": scroll }))
        }
        .await;
        self.finish("mouse", device_id, result)
    }

    /// Captures one frame from the unit's video capture.
    pub async fn get_video_snapshot(&self, device_id: &str) -> CommandResult<Snapshot> {
        let result = async {
            self.require(device_id, Capability::VideoStreaming).await?;
            let request = DeviceRequest::get(SNAPSHOT_PATH, self.timeouts.snapshot)
                .with_query(SNAPSHOT_QUERY);
            let resp = self.execute(device_id, request).await?;
            Ok(Snapshot {
                image_data: base64_encode(&resp.body),
                content_type: resp
                    .content_type
                    .unwrap_or_else(|| DEFAULT_SNAPSHOT_CONTENT_TYPE.to_string()),
            })
        }
        .await;
        self.finish("snapshot", device_id, result)
    }

    /// Re-enumerates the unit's emulated keyboard and mouse.
    pub async fn reset_hid(&self, device_id: &str) -> CommandResult {
        let result = async {
            self.require(device_id, Capability::HidControl).await?;
            let lock = self.input_lock(device_id).await;
            let _held = lock.lock().await;
            let request = DeviceRequest::post_empty(HID_RESET_PATH, self.timeouts.command);
            Ok(self.execute(device_id, request).await?.json_or_text())
        }
        .await;
        self.finish("hid_reset", device_id, result)
    }

    /// Tunes the unit's own streamer (JPEG quality 1-100, frame rate).
    pub async fn set_streamer_params(&self, device_id: &str, quality: u8, fps: u32) -> CommandResult {
        let result = async {
            self.require(device_id, Capability::VideoStreaming).await?;
            let body = streamer_params_body(quality, fps);
            let request = DeviceRequest::post(STREAMER_PARAMS_PATH, body, self.timeouts.command);
            Ok(self.execute(device_id, request).await?.json_or_text())
        }
        .await;
        self.finish("set_streamer_params", device_id, result)
    }

    /// Selects the image served by the unit's virtual media drive.
    pub async fn mount_image(&self, device_id: &str, image: &str) -> CommandResult {
        let result = async {
            self.require(device_id, Capability::MassStorage).await?;
            let request =
                DeviceRequest::post(MSD_SET_IMAGE_PATH, set_image_body(image), self.timeouts.command);
            Ok(self.execute(device_id, request).await?.json_or_text())
        }
        .await;
        self.finish("mount_image", device_id, result)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn finish<T>(
        &self,
        action: &str,
        device_id: &str,
        result: Result<T, GatewayError>,
    ) -> CommandResult<T> {
        match &result {
            Ok(_) => debug!("device {device_id}: {action} ok"),
            Err(e) => warn!("device {device_id}: {action} failed: {e}"),
        }
        CommandResult::from_result(action, device_id, result)
    }

    async fn require(&self, device_id: &str, capability: Capability) -> Result<(), GatewayError> {
        let device = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| GatewayError::State(format!("device {device_id} not found")))?;
        if device.capabilities.supports(capability) {
            Ok(())
        } else {
            Err(GatewayError::Capability(capability))
        }
    }

    async fn session(&self, device_id: &str) -> Result<Arc<Session>, GatewayError> {
        if let Some(existing) = self.sessions.read().await.get(device_id) {
            return Ok(Arc::clone(existing));
        }

        let device = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| GatewayError::State(format!("device {device_id} not found")))?;
        let fresh = Arc::new(self.login(&device.config).await?);

        // Another task may have logged in while this one was waiting.
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(device_id) {
            let existing = Arc::clone(existing);
            drop(sessions);
            fresh.transport.close().await;
            return Ok(existing);
        }
        sessions.insert(device_id.to_string(), Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn login(&self, config: &DeviceConfig) -> Result<Session, GatewayError> {
        let transport = self.transports.open(config)?;
        let request = DeviceRequest::post_empty(LOGIN_PATH, self.timeouts.login);
        let token = match transport.execute(request).await {
            Ok(resp) if resp.is_success() => resp
                .json::<LoginResponse>()
                .ok()
                .and_then(|l| l.access_token),
            Ok(resp) => {
                debug!("device {}: login answered {}", config.id, resp.status);
                None
            }
            Err(e) => {
                warn!("device {}: login failed, using basic auth: {e}", config.id);
                None
            }
        };
        let session = Session { transport, token };
        info!("device {}: session opened ({:?})", config.id, session.mode());
        Ok(session)
    }

    /// Forgets `stale` if it is still the current session of the unit.
    async fn invalidate(&self, device_id: &str, stale: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        let is_current = sessions
            .get(device_id)
            .is_some_and(|s| Arc::ptr_eq(s, stale));
        if is_current {
            sessions.remove(device_id);
            drop(sessions);
            stale.transport.close().await;
        }
    }

    async fn execute(
        &self,
        device_id: &str,
        request: DeviceRequest,
    ) -> Result<DeviceResponse, GatewayError> {
        let session = self.session(device_id).await?;
        let resp = session
            .transport
            .execute(request.clone().with_auth(session.auth()))
            .await?;

        let resp = if resp.is_auth_failure() && session.token.is_some() {
            warn!(
                "device {device_id}: token rejected with {}, re-authenticating",
                resp.status
            );
            self.invalidate(device_id, &session).await;
            let renewed = self.session(device_id).await?;
            renewed
                .transport
                .execute(request.with_auth(renewed.auth()))
                .await?
        } else {
            resp
        };

        check_status(resp)
    }

    async fn input_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.input_locks.lock().await;
        Arc::clone(locks.entry(device_id.to_string()).or_default())
    }

    async fn send_key(&self, device_id: &str, stroke: &KeyStroke) -> Result<(), GatewayError> {
        let body = key_body(&dom_code(&stroke.key), stroke.pressed);
        self.execute(
            device_id,
            DeviceRequest::post(SEND_KEY_PATH, body, self.timeouts.command),
        )
        .await
        .map(|_| ())
    }

    /// Presses every key then releases them in reverse.  A failed press
    /// still releases whatever is already down.
    async fn play_chord(&self, device_id: &str, chord: &Chord) -> Result<(), GatewayError> {
        let delay = self.timeouts.key_event_delay;
        let mut down: Vec<KeyStroke> = Vec::new();

        for (i, press) in chord.presses().into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.send_key(device_id, &press).await {
                self.release_all(device_id, &down).await;
                return Err(e);
            }
            down.push(press);
        }

        let mut first_error = None;
        for release in chord.releases() {
            tokio::time::sleep(delay).await;
            if let Err(e) = self.send_key(device_id, &release).await {
                warn!("device {device_id}: release of {} failed: {e}", release.key);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn release_all(&self, device_id: &str, down: &[KeyStroke]) {
        for press in down.iter().rev() {
            tokio::time::sleep(self.timeouts.key_event_delay).await;
            let release = KeyStroke {
                key: press.key.clone(),
                pressed: false,
            };
            if let Err(e) = self.send_key(device_id, &release).await {
                warn!("device {device_id}: release of {} failed: {e}", press.key);
            }
        }
    }
}

fn check_status(resp: DeviceResponse) -> Result<DeviceResponse, GatewayError> {
    if resp.is_success() {
        Ok(resp)
    } else if resp.is_auth_failure() {
        Err(GatewayError::Auth(format!("HTTP {}: {}", resp.status, resp.text())))
    } else {
        Err(GatewayError::http_status(resp.status, resp.text()))
    }
}

/// Encodes bytes as standard base64 (RFC 4648, with padding).
///
/// Every 3 input bytes become 4 characters of the alphabet `A-Za-z0-9+/`;
/// a short final chunk is padded with `=`.
pub fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        let sextet = |shift: u32| ALPHABET[((n >> shift) & 0x3F) as usize] as char;

        out.push(sextet(18));
        out.push(sextet(12));
        out.push(if chunk.len() > 1 { sextet(6) } else { '=' });
        out.push(if chunk.len() > 2 { sextet(0) } else { '=' });
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
