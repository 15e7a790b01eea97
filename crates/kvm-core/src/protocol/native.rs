//! The remote unit's REST API.
//!
//! Every unit speaks the same small HTTP API.  This module names its
//! endpoints and builds its JSON bodies so the gateway never formats a path
//! or payload inline.
//!
//! | Concern        | Endpoint                              | Method |
//! |----------------|---------------------------------------|--------|
//! | Reachability   | `/api/auth/check`                     | GET    |
//! | Login          | `/api/auth/login`                     | POST   |
//! | Unit details   | `/api/info`, `/api/hw`                | GET    |
//! | Power          | `/api/atx`                            | POST   |
//! | Keyboard       | `/api/hid/events/send_key`            | POST   |
//! | Mouse          | `/api/hid/events/mouse/{move,button,wheel}` | POST |
//! | HID reset      | `/api/hid/reset`                      | POST   |
//! | Snapshot       | `/api/streamer/snapshot`              | GET    |
//! | Streamer tune  | `/api/streamer/set_params`            | POST   |
//! | Virtual media  | `/api/msd/set_image`                  | POST   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::device::Capability;

// ── Paths ─────────────────────────────────────────────────────────────────────

pub const AUTH_CHECK_PATH: &str = "/api/auth/check";
pub const LOGIN_PATH: &str = "/api/auth/login";
pub const INFO_PATH: &str = "/api/info";
pub const HW_PATH: &str = "/api/hw";
pub const ATX_PATH: &str = "/api/atx";
pub const HID_PATH: &str = "/api/hid";
pub const STREAMER_PATH: &str = "/api/streamer";
pub const MSD_PATH: &str = "/api/msd";
pub const SEND_KEY_PATH: &str = "/api/hid/events/send_key";
pub const MOUSE_MOVE_PATH: &str = "/api/hid/events/mouse/move";
pub const MOUSE_BUTTON_PATH: &str = "/api/hid/events/mouse/button";
pub const MOUSE_WHEEL_PATH: &str = "/api/hid/events/mouse/wheel";
pub const HID_RESET_PATH: &str = "/api/hid/reset";
pub const SNAPSHOT_PATH: &str = "/api/streamer/snapshot";
pub const STREAMER_PARAMS_PATH: &str = "/api/streamer/set_params";
pub const MSD_SET_IMAGE_PATH: &str = "/api/msd/set_image";

/// Query string for a snapshot request.
pub const SNAPSHOT_QUERY: &[(&str, &str)] = &[("preview", "1"), ("preview_quality", "80")];

/// Content type assumed when the unit omits one on a snapshot.
pub const DEFAULT_SNAPSHOT_CONTENT_TYPE: &str = "image/jpeg";

/// Endpoint probed to decide whether a unit has `capability`.
pub fn capability_probe_path(capability: Capability) -> &'static str {
    match capability {
        Capability::PowerControl => ATX_PATH,
        Capability::HidControl => HID_PATH,
        Capability::VideoStreaming => STREAMER_PATH,
        Capability::MassStorage => MSD_PATH,
    }
}

// ── Power ─────────────────────────────────────────────────────────────────────

/// Abstract power operations accepted from operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    Restart,
    Reset,
    Sleep,
}

impl PowerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerAction::PowerOn => "power_on",
            PowerAction::PowerOff => "power_off",
            PowerAction::Restart => "restart",
            PowerAction::Reset => "reset",
            PowerAction::Sleep => "sleep",
        }
    }

    /// The ATX action code the unit understands.
    ///
    /// Restart and reset both pulse the hard-reset line; sleep is a short
    /// press of the power button.
    pub fn native_code(self) -> &'static str {
        match self {
            PowerAction::PowerOn => "power_on",
            PowerAction::PowerOff => "power_off_hard",
            PowerAction::Restart => "power_reset_hard",
            PowerAction::Reset => "power_reset_hard",
            PowerAction::Sleep => "power_off",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown power action name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPowerAction(pub String);

impl fmt::Display for UnknownPowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown power action: {}", self.0)
    }
}

impl std::error::Error for UnknownPowerAction {}

impl FromStr for PowerAction {
    type Err = UnknownPowerAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power_on" => Ok(PowerAction::PowerOn),
            "power_off" => Ok(PowerAction::PowerOff),
            "restart" => Ok(PowerAction::Restart),
            "reset" => Ok(PowerAction::Reset),
            "sleep" => Ok(PowerAction::Sleep),
            other => Err(UnknownPowerAction(other.to_string())),
        }
    }
}

// ── Request bodies ────────────────────────────────────────────────────────────

pub fn power_body(action: PowerAction) -> Value {
    json!({ "action": action.native_code() })
}

pub fn key_body(code: &str, pressed: bool) -> Value {
    json!({ "key": code, "state": pressed })
}

pub fn mouse_move_body(x: i32, y: i32) -> Value {
    json!({ "to": { "x": x, "y": y } })
}

pub fn mouse_button_body(button: &str, pressed: bool) -> Value {
    json!({ "button": button, "state": pressed })
}

pub fn mouse_wheel_body(delta_y: i32) -> Value {
    json!({ "delta": { "x": 0, "y": delta_y } })
}

pub fn streamer_params_body(quality: u8, fps: u32) -> Value {
    json!({ "quality": quality, "fps": fps })
}

pub fn set_image_body(image: &str) -> Value {
    json!({ "image": image })
}

/// Body of a successful `/api/auth/login` answer.
///
/// Units that only support basic auth answer without a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
