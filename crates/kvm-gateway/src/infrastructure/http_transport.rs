//! reqwest implementation of [`DeviceTransport`].
//!
//! Each registered unit (and each session) gets its own `reqwest::Client`,
//! so connection pools never mix hosts and closing one unit's transport
//! cannot affect another.  KVM units usually ship self-signed certificates;
//! `accept_invalid_certs` (on by default in the config) lets HTTPS work
//! against them.  Units are always reached directly, never through a
//! system proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kvm_core::{Credentials, DeviceConfig, GatewayError};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::application::transport::{
    Authorization, DeviceRequest, DeviceResponse, DeviceTransport, Method, TransportFactory,
};

/// Opens one [`HttpDeviceTransport`] per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransportFactory {
    pub accept_invalid_certs: bool,
}

impl HttpTransportFactory {
    pub fn new(accept_invalid_certs: bool) -> Self {
        Self {
            accept_invalid_certs,
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn open(&self, device: &DeviceConfig) -> Result<Arc<dyn DeviceTransport>, GatewayError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .no_proxy()
            .build()
            .map_err(|e| GatewayError::Connectivity(format!("cannot build HTTP client: {e}")))?;
        Ok(Arc::new(HttpDeviceTransport {
            base_url: device.endpoint().base_url(),
            credentials: device.credentials(),
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Talks to one unit's REST API.
pub struct HttpDeviceTransport {
    base_url: String,
    credentials: Credentials,
    client: Client,
    closed: AtomicBool,
}

#[async_trait]
impl DeviceTransport for HttpDeviceTransport {
    async fn execute(&self, request: DeviceRequest) -> Result<DeviceResponse, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Connectivity(format!(
                "transport to {} is closed",
                self.base_url
            )));
        }

        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        }
        .timeout(request.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.auth {
            Authorization::Basic => {
                builder.basic_auth(&self.credentials.username, Some(&self.credentials.password))
            }
            Authorization::Bearer(token) => builder.bearer_auth(token),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| connectivity(&url, &e))?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(|e| connectivity(&url, &e))?;
        debug!("{:?} {url} -> {status} ({} bytes)", request.method, body.len());

        Ok(DeviceResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn connectivity(url: &str, e: &reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Connectivity(format!("{url}: timed out"))
    } else {
        GatewayError::Connectivity(format!("{url}: {e}"))
    }
}
