//! The seam between the gateway and a unit's REST API.
//!
//! The application layer never builds HTTP requests directly.  It describes
//! each call as a [`DeviceRequest`] and hands it to a [`DeviceTransport`].
//! Production uses the reqwest implementation in
//! `infrastructure::http_transport`; tests use the in-memory units in
//! `infrastructure::mock`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvm_core::{DeviceConfig, GatewayError};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// HTTP method of a device call.  Units only use these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// How a request authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// HTTP basic auth with the device's configured credentials.
    Basic,
    /// Cached token from `/api/auth/login`.
    Bearer(String),
}

/// One call to a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub method: Method,
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub auth: Authorization,
}

impl DeviceRequest {
    pub fn get(path: &'static str, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            path,
            query: Vec::new(),
            body: None,
            timeout,
            auth: Authorization::Basic,
        }
    }

    pub fn post(path: &'static str, body: Value, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            path,
            query: Vec::new(),
            body: Some(body),
            timeout,
            auth: Authorization::Basic,
        }
    }

    /// A POST with no body (login, HID reset).
    pub fn post_empty(path: &'static str, timeout: Duration) -> Self {
        Self {
            body: None,
            ..Self::post(path, Value::Null, timeout)
        }
    }

    pub fn with_query(mut self, query: &[(&'static str, &str)]) -> Self {
        self.query = query.iter().map(|(k, v)| (*k, v.to_string())).collect();
        self
    }

    pub fn with_auth(mut self, auth: Authorization) -> Self {
        self.auth = auth;
        self
    }
}

/// A unit's answer.  Non-200 statuses are returned, not raised; callers
/// decide what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl DeviceResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Protocol`] when the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_slice(&self.body).map_err(|e| GatewayError::Protocol {
            status: Some(self.status),
            message: format!("invalid JSON body: {e}"),
        })
    }

    /// The body as JSON, or as a JSON string when it is not JSON, or `null`
    /// when empty.
    pub fn json_or_text(&self) -> Value {
        if self.body.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&self.body).unwrap_or_else(|_| Value::String(self.text()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes requests against one unit.
///
/// Implementations map network failures and timeouts to
/// [`GatewayError::Connectivity`]; every HTTP answer, whatever its status,
/// is `Ok`.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn execute(&self, request: DeviceRequest) -> Result<DeviceResponse, GatewayError>;

    /// Releases pooled connections.  Idempotent.
    async fn close(&self) {}
}

/// Opens transports for registered units.
pub trait TransportFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`GatewayError::Connectivity`] when the client cannot be built
    /// (e.g. an invalid host).
    fn open(&self, device: &DeviceConfig) -> Result<Arc<dyn DeviceTransport>, GatewayError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> DeviceResponse {
        DeviceResponse {
            status,
            content_type: None,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_only_200_is_success() {
        assert!(response(200, "").is_success());
        assert!(!response(201, "").is_success());
        assert!(!response(500, "").is_success());
    }

    #[test]
    fn test_auth_failure_statuses() {
        assert!(response(401, "").is_auth_failure());
        assert!(response(403, "").is_auth_failure());
        assert!(!response(404, "").is_auth_failure());
    }

    #[test]
    fn test_json_or_text_falls_back_to_string() {
        assert_eq!(response(200, r#"{"ok":true}"#).json_or_text()["ok"], true);
        assert_eq!(response(500, "boom").json_or_text(), Value::String("boom".into()));
        assert_eq!(response(200, "").json_or_text(), Value::Null);
    }

    #[test]
    fn test_json_decode_error_is_protocol() {
        let err = response(200, "not json").json::<Value>().unwrap_err();
        assert_eq!(err.kind(), kvm_core::ErrorKind::Protocol);
    }

    #[test]
    fn test_request_builders() {
        let req = DeviceRequest::get("/api/streamer/snapshot", Duration::from_secs(15))
            .with_query(&[("preview", "1")])
            .with_auth(Authorization::Bearer("t".into()));
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.query, vec![("preview", "1".to_string())]);
        assert_eq!(req.auth, Authorization::Bearer("t".into()));
        assert!(req.body.is_none());
    }
}
