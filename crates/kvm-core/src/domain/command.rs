//! Uniform result record returned by every hardware command.
//!
//! Hardware calls fail for many reasons (network down, wrong password,
//! unsupported feature).  Instead of propagating those errors to callers,
//! the session layer folds each outcome into a [`CommandResult`] so the API
//! layer can serialize it directly as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::DeviceId;
use crate::error::{ErrorKind, GatewayError};

/// Serializable description of why a command failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&GatewayError> for CommandFailure {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one hardware command.
///
/// # Example JSON
///
/// ```json
/// {
///   "success": true,
///   "action": "power_on",
///   "device_id": "rack-3",
///   "data": {"ok": true},
///   "timestamp": "2025-01-01T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult<T = serde_json::Value> {
    pub success: bool,
    pub action: String,
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
    pub timestamp: DateTime<Utc>,
}

impl<T> CommandResult<T> {
    /// Constructs a successful result carrying `data`.
    pub fn ok(action: impl Into<String>, device_id: impl Into<DeviceId>, data: T) -> Self {
        Self {
            success: true,
            action: action.into(),
            device_id: device_id.into(),
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Constructs a failed result from a gateway error.
    pub fn err(action: impl Into<String>, device_id: impl Into<DeviceId>, err: &GatewayError) -> Self {
        Self {
            success: false,
            action: action.into(),
            device_id: device_id.into(),
            data: None,
            error: Some(CommandFailure::from(err)),
            timestamp: Utc::now(),
        }
    }

    /// Folds a `Result` into a record.
    pub fn from_result(
        action: impl Into<String>,
        device_id: impl Into<DeviceId>,
        result: Result<T, GatewayError>,
    ) -> Self {
        match result {
            Ok(data) => Self::ok(action, device_id, data),
            Err(e) => Self::err(action, device_id, &e),
        }
    }

    /// Returns the error kind when the command failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// A single captured video frame, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub image_data: String,
    pub content_type: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
