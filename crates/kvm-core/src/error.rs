//! Error taxonomy shared by every layer of the gateway.
//!
//! Every failure that can happen while talking to a remote unit falls into
//! one of five kinds.  The hardware layer never lets these escape as panics
//! or early returns past its boundary: they are folded into a
//! [`CommandResult`](crate::domain::command::CommandResult) whose `error.kind`
//! field carries the [`ErrorKind`] discriminant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::device::Capability;

/// Serializable discriminant of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The unit could not be reached or did not answer in time.
    Connectivity,
    /// The unit rejected the credentials or the cached token.
    Auth,
    /// The unit does not support the capability the command needs.
    Capability,
    /// The unit answered with an unexpected status or body.
    Protocol,
    /// The device, session or stream the call refers to does not exist.
    State,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Auth => "auth",
            ErrorKind::Capability => "capability",
            ErrorKind::Protocol => "protocol",
            ErrorKind::State => "state",
        }
    }
}

/// Errors produced by the gateway while operating remote units.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Unreachable host, refused connection, or request timeout.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Bad or expired credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The command needs a capability the probe did not find on the unit.
    #[error("device does not support {}", .0.as_str())]
    Capability(Capability),

    /// Unexpected status code or undecodable body.
    #[error("{}", format_protocol(.status, .message))]
    Protocol {
        /// HTTP status when the unit answered at all.
        status: Option<u16>,
        message: String,
    },

    /// Operating on something that does not exist or is already stopped.
    #[error("invalid state: {0}")]
    State(String),
}

fn format_protocol(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("HTTP {code}: {message}"),
        None => format!("protocol error: {message}"),
    }
}

impl GatewayError {
    /// Returns the serializable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Connectivity(_) => ErrorKind::Connectivity,
            GatewayError::Auth(_) => ErrorKind::Auth,
            GatewayError::Capability(_) => ErrorKind::Capability,
            GatewayError::Protocol { .. } => ErrorKind::Protocol,
            GatewayError::State(_) => ErrorKind::State,
        }
    }

    /// Shorthand for a [`GatewayError::Protocol`] carrying an HTTP status.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        GatewayError::Protocol {
            status: Some(status),
            message: message.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            GatewayError::Connectivity("x".into()).kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(GatewayError::Auth("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(
            GatewayError::Capability(Capability::PowerControl).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            GatewayError::http_status(500, "boom").kind(),
            ErrorKind::Protocol
        );
        assert_eq!(GatewayError::State("x".into()).kind(), ErrorKind::State);
    }

    #[test]
    fn test_protocol_error_display_includes_status() {
        let err = GatewayError::http_status(503, "busy");
        assert_eq!(err.to_string(), "HTTP 503: busy");
    }

    #[test]
    fn test_protocol_error_display_without_status() {
        let err = GatewayError::Protocol {
            status: None,
            message: "bad json".into(),
        };
        assert_eq!(err.to_string(), "protocol error: bad json");
    }

    #[test]
    fn test_capability_error_names_the_capability() {
        let err = GatewayError::Capability(Capability::HidControl);
        assert_eq!(err.to_string(), "device does not support hid_control");
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Connectivity).unwrap();
        assert_eq!(json, "\"connectivity\"");
    }
}
