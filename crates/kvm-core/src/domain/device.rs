//! Remote KVM units and their probed capabilities.
//!
//! A [`DeviceConfig`] is what an operator registers (where the unit lives and
//! how to log in).  A [`Device`] is that config plus the runtime facts the
//! gateway learns by probing: connection status, last heartbeat, and the
//! fixed [`Capabilities`] set.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a registered unit, chosen by the operator (e.g. `"rack-3"`).
pub type DeviceId = String;

/// URL scheme used to reach a unit's REST API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Network location of a unit's REST API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl DeviceEndpoint {
    /// Returns `scheme://host:port` with no trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Login credentials for a unit.
///
/// `Debug` never prints the password so configs can be logged safely.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One optional feature a unit may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// ATX power button / reset line control.
    PowerControl,
    /// Emulated USB keyboard and mouse.
    HidControl,
    /// Video capture (snapshots and streams).
    VideoStreaming,
    /// Virtual media drive for booting images.
    MassStorage,
}

impl Capability {
    /// Every capability, in probe order.
    pub const ALL: [Capability; 4] = [
        Capability::PowerControl,
        Capability::HidControl,
        Capability::VideoStreaming,
        Capability::MassStorage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::PowerControl => "power_control",
            Capability::HidControl => "hid_control",
            Capability::VideoStreaming => "video_streaming",
            Capability::MassStorage => "mass_storage",
        }
    }
}

/// The fixed capability set of a unit, filled in by probing.
///
/// All flags start `false`; a command is only attempted when its flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub power_control: bool,
    pub hid_control: bool,
    pub video_streaming: bool,
    pub mass_storage: bool,
}

impl Capabilities {
    /// A set with every capability enabled.
    pub fn all() -> Self {
        Self {
            power_control: true,
            hid_control: true,
            video_streaming: true,
            mass_storage: true,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::PowerControl => self.power_control,
            Capability::HidControl => self.hid_control,
            Capability::VideoStreaming => self.video_streaming,
            Capability::MassStorage => self.mass_storage,
        }
    }

    pub fn set(&mut self, capability: Capability, supported: bool) {
        match capability {
            Capability::PowerControl => self.power_control = supported,
            Capability::HidControl => self.hid_control = supported,
            Capability::VideoStreaming => self.video_streaming = supported,
            Capability::MassStorage => self.mass_storage = supported,
        }
    }
}

/// Reachability of a unit as last observed by a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
    Connecting,
    Error,
}

// ── Registration input ────────────────────────────────────────────────────────

fn default_port() -> u16 {
    80
}

/// Everything needed to register a unit.
///
/// Deserializes from one `[[devices]]` entry of the gateway config file:
///
/// ```toml
/// [[devices]]
/// id = "rack-3"
/// name = "Rack 3 build server"
/// host = "10.0.4.17"
/// port = 443
/// scheme = "https"
/// username = "admin"
/// password = "admin"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    /// Display name; defaults to the id when absent.
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
    pub username: String,
    pub password: String,
}

impl DeviceConfig {
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            host: self.host.clone(),
            port: self.port,
            scheme: self.scheme,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Returns the display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A registered unit: its config plus runtime state learned by probing.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub config: DeviceConfig,
    pub status: ConnectionStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Capabilities,
}

impl Device {
    /// Wraps a config in a not-yet-probed device.
    pub fn from_config(config: DeviceConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            last_heartbeat: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

// ── Status report ─────────────────────────────────────────────────────────────

/// Status record returned by a status query; never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub status: ConnectionStatus,
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The unit's `/api/info` payload (firmware, platform), when it answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// The unit's `/api/hw` payload, when it answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Value>,
}

impl DeviceStatusReport {
    pub fn from_device(device: &Device) -> Self {
        Self {
            device_id: device.config.id.clone(),
            name: Some(device.config.display_name().to_string()),
            host: Some(device.config.host.clone()),
            status: device.status,
            connected: device.is_connected(),
            last_heartbeat: device.last_heartbeat,
            capabilities: device.capabilities,
            error: None,
            info: None,
            hardware: None,
        }
    }

    /// An `error`-status record used when the query itself failed.
    pub fn error(device_id: impl Into<DeviceId>, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            host: None,
            status: ConnectionStatus::Error,
            connected: false,
            last_heartbeat: None,
            capabilities: Capabilities::default(),
            error: Some(message.into()),
            info: None,
            hardware: None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> DeviceConfig {
        DeviceConfig {
            id: "rack-3".to_string(),
            name: String::new(),
            host: "10.0.4.17".to_string(),
            port: 443,
            scheme: Scheme::Https,
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn test_base_url_includes_scheme_host_and_port() {
        let cfg = make_config();
        assert_eq!(cfg.endpoint().base_url(), "https://10.0.4.17:443");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = make_config().credentials();
        let printed = format!("{creds:?}");
        assert!(printed.contains("admin"));
        assert!(!printed.contains("hunter2"), "password must never be printed");
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let mut cfg = make_config();
        assert_eq!(cfg.display_name(), "rack-3");
        cfg.name = "Build server".to_string();
        assert_eq!(cfg.display_name(), "Build server");
    }

    #[test]
    fn test_new_device_starts_disconnected_without_capabilities() {
        let device = Device::from_config(make_config());
        assert_eq!(device.status, ConnectionStatus::Disconnected);
        assert!(device.last_heartbeat.is_none());
        assert_eq!(device.capabilities, Capabilities::default());
    }

    #[test]
    fn test_capabilities_set_and_supports_agree() {
        let mut caps = Capabilities::default();
        for cap in Capability::ALL {
            assert!(!caps.supports(cap));
            caps.set(cap, true);
            assert!(caps.supports(cap));
        }
        assert_eq!(caps, Capabilities::all());
    }

    #[test]
    fn test_device_config_toml_defaults() {
        let cfg: DeviceConfig = serde_json::from_value(serde_json::json!({
            "id": "d1",
            "host": "192.168.1.20",
            "username": "admin",
            "password": "admin"
        }))
        .unwrap();
        assert_eq!(cfg.port, 80);
        assert_eq!(cfg.scheme, Scheme::Http);
        assert!(cfg.name.is_empty());
    }

    #[test]
    fn test_error_report_is_not_connected() {
        let report = DeviceStatusReport::error("ghost", "device not found");
        assert_eq!(report.status, ConnectionStatus::Error);
        assert!(!report.connected);
        assert_eq!(report.error.as_deref(), Some("device not found"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
    }
}
