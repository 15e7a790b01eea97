//! Seams to the authorization and audit services of the outer API layer.
//!
//! The gateway does not authenticate users itself.  The API layer in front
//! of it does, then passes the user name along; before acting the gateway
//! asks a [`PermissionGate`] and afterwards reports to an [`AuditSink`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Access level needed for an operation.  Levels are ordered: `Admin`
/// implies `Control` implies `View`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    View,
    Control,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::View => "view",
            PermissionLevel::Control => "control",
            PermissionLevel::Admin => "admin",
        }
    }
}

/// Answers "may `user` do `level` things to `device_id`?".
#[cfg_attr(test, mockall::automock)]
pub trait PermissionGate: Send + Sync {
    fn has_permission(&self, user: &str, device_id: &str, level: PermissionLevel) -> bool;
}

/// Grants everything.  Used when the upstream API layer has already
/// authorized the request before it reaches the gateway.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedUpstreamGate;

impl PermissionGate for TrustedUpstreamGate {
    fn has_permission(&self, _user: &str, _device_id: &str, _level: PermissionLevel) -> bool {
        true
    }
}

/// Receives one record per operator action.  Calls are fire-and-forget:
/// the gateway never waits on them before answering.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(&self, user_id: &str, action: &str, device_id: &str, details: Value);
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_action(&self, user_id: &str, action: &str, device_id: &str, details: Value) {
        info!(target: "audit", user = user_id, action, device = device_id, %details, "operator action");
    }
}
