//! Gateway configuration file.
//!
//! The gateway reads one TOML file at startup.  Every field has a default,
//! so an empty file (or no file at all) is a valid configuration:
//!
//! ```toml
//! [gateway]
//! bind_address = "0.0.0.0"
//! ws_port = 24810
//! status_interval_secs = 300
//!
//! [timeouts]
//! command_secs = 10
//! snapshot_secs = 15
//!
//! [[devices]]
//! id = "rack-3"
//! host = "10.0.4.17"
//! username = "admin"
//! password = "admin"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file.  CLI flags
//! (see `main.rs`) are applied on top of the parsed file.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kvm_core::DeviceConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but a value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub streaming: StreamingSettings,
    /// Units registered at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Listener and background-task settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySettings {
    /// IP address the WebSocket listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port of the WebSocket listener.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between status-monitor sweeps.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Accept self-signed TLS certificates from units.  Most KVM units ship
    /// with one.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

/// Per-call timeouts, in seconds unless stated otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSettings {
    #[serde(default = "default_auth_check")]
    pub auth_check_secs: u64,
    #[serde(default = "default_capability_probe")]
    pub capability_probe_secs: u64,
    #[serde(default = "default_login")]
    pub login_secs: u64,
    #[serde(default = "default_command")]
    pub command_secs: u64,
    #[serde(default = "default_snapshot")]
    pub snapshot_secs: u64,
    /// Pause between consecutive key events of a chord.
    #[serde(default = "default_key_delay")]
    pub key_event_delay_ms: u64,
}

/// Heartbeat periods of the status-only stream loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingSettings {
    #[serde(default = "default_webrtc_heartbeat")]
    pub webrtc_heartbeat_secs: u64,
    #[serde(default = "default_h264_heartbeat")]
    pub h264_heartbeat_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_ws_port() -> u16 {
    24810
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_status_interval() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_auth_check() -> u64 {
    5
}
fn default_capability_probe() -> u64 {
    3
}
fn default_login() -> u64 {
    10
}
fn default_command() -> u64 {
    10
}
fn default_snapshot() -> u64 {
    15
}
fn default_key_delay() -> u64 {
    10
}
fn default_webrtc_heartbeat() -> u64 {
    5
}
fn default_h264_heartbeat() -> u64 {
    10
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_port: default_ws_port(),
            log_level: default_log_level(),
            status_interval_secs: default_status_interval(),
            accept_invalid_certs: default_true(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            auth_check_secs: default_auth_check(),
            capability_probe_secs: default_capability_probe(),
            login_secs: default_login(),
            command_secs: default_command(),
            snapshot_secs: default_snapshot(),
            key_event_delay_ms: default_key_delay(),
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            webrtc_heartbeat_secs: default_webrtc_heartbeat(),
            h264_heartbeat_secs: default_h264_heartbeat(),
        }
    }
}

impl GatewaySettings {
    /// Parses `bind_address:ws_port` into a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.ws_port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bad listen address: {e}")))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl TimeoutSettings {
    pub fn auth_check(&self) -> Duration {
        Duration::from_secs(self.auth_check_secs)
    }
    pub fn capability_probe(&self) -> Duration {
        Duration::from_secs(self.capability_probe_secs)
    }
    pub fn login(&self) -> Duration {
        Duration::from_secs(self.login_secs)
    }
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
    pub fn snapshot(&self) -> Duration {
        Duration::from_secs(self.snapshot_secs)
    }
    pub fn key_event_delay(&self) -> Duration {
        Duration::from_millis(self.key_event_delay_ms)
    }
}

impl StreamingSettings {
    pub fn webrtc_heartbeat(&self) -> Duration {
        Duration::from_secs(self.webrtc_heartbeat_secs)
    }
    pub fn h264_heartbeat(&self) -> Duration {
        Duration::from_secs(self.h264_heartbeat_secs)
    }
}

impl GatewayConfig {
    /// Checks ranges and uniqueness rules the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        for (name, value) in [
            ("login_secs", t.login_secs),
            ("command_secs", t.command_secs),
            ("snapshot_secs", t.snapshot_secs),
        ] {
            if !(3..=30).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "timeouts.{name} must be between 3 and 30, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("auth_check_secs", t.auth_check_secs),
            ("capability_probe_secs", t.capability_probe_secs),
        ] {
            if !(1..=30).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "timeouts.{name} must be between 1 and 30, got {value}"
                )));
            }
        }
        if self.gateway.status_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.status_interval_secs must be positive".to_string(),
            ));
        }
        if self.streaming.webrtc_heartbeat_secs == 0 || self.streaming.h264_heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "streaming heartbeats must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(ConfigError::Invalid("device id must not be empty".to_string()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device id: {}",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

/// Parses and validates TOML text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed TOML and
/// [`ConfigError::Invalid`] for out-of-range values.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let cfg: GatewayConfig = toml::from_str(content)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Loads the config at `path`, or the defaults when `path` is `None`.
///
/// Unlike a missing *default* location, an explicitly given path that does
/// not exist is an error.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the file cannot be read, plus the errors
/// of [`parse_config`].
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(GatewayConfig::default());
    };
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
