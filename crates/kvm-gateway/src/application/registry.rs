//! Registered units and their probed reachability.
//!
//! # Probing
//!
//! A probe is one authenticated reachability check against
//! `/api/auth/check` (the *primary* check) plus one short check per optional
//! capability endpoint.  All five run concurrently; a failing capability
//! check only clears that one flag.  A unit is accepted on registration only
//! when the primary check answers 200.
//!
//! A status query additionally fetches the unit's `/api/info` and `/api/hw`
//! payloads; either one missing just leaves that part of the report empty.
//!
//! # Locking
//!
//! The device map sits behind a `tokio::sync::RwLock` that is never held
//! across a probe.  A refresh copies what it needs, releases the lock,
//! probes, then re-acquires the lock and writes back only if the same
//! registration is still present.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use kvm_core::protocol::native::{capability_probe_path, AUTH_CHECK_PATH, HW_PATH, INFO_PATH};
use kvm_core::{
    Capabilities, Capability, ConnectionStatus, Device, DeviceConfig, DeviceId,
    DeviceStatusReport, GatewayError,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::transport::{DeviceRequest, DeviceTransport, TransportFactory};

/// Timeouts applied during a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    /// Timeout of the `/api/auth/check` call.
    pub primary: Duration,
    /// Timeout of each capability endpoint call.
    pub capability: Duration,
    /// Timeout of the `/api/info` and `/api/hw` calls of a status query.
    pub details: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            primary: Duration::from_secs(5),
            capability: Duration::from_secs(3),
            details: Duration::from_secs(10),
        }
    }
}

/// Outcome of one probe, applied to a [`Device`] afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProbeOutcome {
    reachable: bool,
    capabilities: Capabilities,
}

struct Registration {
    device: Device,
    transport: Arc<dyn DeviceTransport>,
}

/// The set of units the gateway operates.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Registration>>,
    transports: Arc<dyn TransportFactory>,
    timeouts: ProbeTimeouts,
}

impl DeviceRegistry {
    pub fn new(transports: Arc<dyn TransportFactory>, timeouts: ProbeTimeouts) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            transports,
            timeouts,
        }
    }

    /// Probes `config` and registers it when the primary check succeeds.
    ///
    /// Registering an id that already exists replaces the earlier entry once
    /// the new probe succeeds; a failed probe leaves the earlier entry alone.
    pub async fn add_device(&self, config: DeviceConfig) -> bool {
        let id = config.id.clone();
        let transport = match self.transports.open(&config) {
            Ok(t) => t,
            Err(e) => {
                warn!("device {id}: cannot open transport: {e}");
                return false;
            }
        };

        let mut device = Device::from_config(config);
        device.status = ConnectionStatus::Connecting;
        let outcome = self.probe(&id, transport.as_ref()).await;
        apply_outcome(&mut device, outcome);

        if !outcome.reachable {
            warn!(
                "device {id}: primary check failed at {}; not registered",
                device.config.endpoint().base_url()
            );
            transport.close().await;
            return false;
        }

        info!(
            "device {id} registered ({}), capabilities: {:?}",
            device.config.endpoint().base_url(),
            device.capabilities
        );
        let previous = self
            .devices
            .write()
            .await
            .insert(id, Registration { device, transport });
        if let Some(old) = previous {
            old.transport.close().await;
        }
        true
    }

    /// Removes a unit.  Returns `false` when it was not registered.
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let removed = self.devices.write().await.remove(device_id);
        match removed {
            Some(reg) => {
                reg.transport.close().await;
                info!("device {device_id} deregistered");
                true
            }
            None => false,
        }
    }

    /// Re-runs the probe for a registered unit and writes the result back.
    ///
    /// Returns `true` when the unit answered the primary check.
    pub async fn test_connection(&self, device_id: &str) -> bool {
        match self.refresh(device_id).await {
            Ok((device, _)) => device.is_connected(),
            Err(e) => {
                debug!("device {device_id}: connection test failed: {e}");
                false
            }
        }
    }

    /// Re-probes a unit, then reports its status.  Never fails: errors,
    /// including an unknown id, produce an `error` status record.
    pub async fn get_device_status(&self, device_id: &str) -> DeviceStatusReport {
        let (device, transport) = match self.refresh(device_id).await {
            Ok(refreshed) => refreshed,
            Err(e) => return DeviceStatusReport::error(device_id, e.to_string()),
        };

        let mut report = DeviceStatusReport::from_device(&device);
        if device.is_connected() {
            let (info, hardware) = tokio::join!(
                self.fetch_details(device_id, transport.as_ref(), INFO_PATH),
                self.fetch_details(device_id, transport.as_ref(), HW_PATH),
            );
            report.info = info;
            report.hardware = hardware;
        }
        report
    }

    /// Re-probes every registered unit concurrently.
    pub async fn refresh_all(&self) -> Vec<DeviceStatusReport> {
        let ids: Vec<DeviceId> = self.devices.read().await.keys().cloned().collect();
        join_all(ids.iter().map(|id| self.get_device_status(id))).await
    }

    /// Snapshot of one unit.
    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|r| r.device.clone())
    }

    /// Snapshot of every unit, sorted by id.
    pub async fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .map(|r| r.device.clone())
            .collect();
        devices.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Closes every probe transport.  Registrations are kept.
    pub async fn close(&self) {
        let transports: Vec<_> = self
            .devices
            .read()
            .await
            .values()
            .map(|r| Arc::clone(&r.transport))
            .collect();
        for transport in transports {
            transport.close().await;
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn refresh(
        &self,
        device_id: &str,
    ) -> Result<(Device, Arc<dyn DeviceTransport>), GatewayError> {
        let transport = {
            let guard = self.devices.read().await;
            let reg = guard
                .get(device_id)
                .ok_or_else(|| GatewayError::State(format!("device {device_id} not found")))?;
            Arc::clone(&reg.transport)
        };

        let outcome = self.probe(device_id, transport.as_ref()).await;

        let mut guard = self.devices.write().await;
        match guard.get_mut(device_id) {
            Some(reg) if Arc::ptr_eq(&reg.transport, &transport) => {
                apply_outcome(&mut reg.device, outcome);
                Ok((reg.device.clone(), transport))
            }
            Some(_) => Err(GatewayError::State(format!(
                "device {device_id} was re-registered during the probe"
            ))),
            None => Err(GatewayError::State(format!(
                "device {device_id} was removed during the probe"
            ))),
        }
    }

    async fn probe(&self, device_id: &str, transport: &dyn DeviceTransport) -> ProbeOutcome {
        let primary = async {
            match transport
                .execute(DeviceRequest::get(AUTH_CHECK_PATH, self.timeouts.primary))
                .await
            {
                Ok(resp) if resp.is_success() => true,
                Ok(resp) => {
                    debug!("device {device_id}: auth check answered {}", resp.status);
                    false
                }
                Err(e) => {
                    debug!("device {device_id}: auth check failed: {e}");
                    false
                }
            }
        };
        let checks = join_all(
            Capability::ALL
                .iter()
                .map(|cap| self.check_capability(device_id, transport, *cap)),
        );

        let (reachable, results) = tokio::join!(primary, checks);

        let mut capabilities = Capabilities::default();
        for (cap, supported) in Capability::ALL.iter().zip(results) {
            capabilities.set(*cap, supported);
        }
        ProbeOutcome {
            reachable,
            capabilities,
        }
    }

    async fn check_capability(
        &self,
        device_id: &str,
        transport: &dyn DeviceTransport,
        capability: Capability,
    ) -> bool {
        let request = DeviceRequest::get(capability_probe_path(capability), self.timeouts.capability);
        match transport.execute(request).await {
            Ok(resp) => {
                debug!(
                    "device {device_id}: {} probe answered {}",
                    capability.as_str(),
                    resp.status
                );
                resp.is_success()
            }
            Err(e) => {
                debug!("device {device_id}: {} probe failed: {e}", capability.as_str());
                false
            }
        }
    }

    /// GETs one detail payload; any failure yields `None`.
    async fn fetch_details(
        &self,
        device_id: &str,
        transport: &dyn DeviceTransport,
        path: &'static str,
    ) -> Option<Value> {
        match transport.execute(DeviceRequest::get(path, self.timeouts.details)).await {
            Ok(resp) if resp.is_success() => resp.json::<Value>().ok(),
            Ok(resp) => {
                debug!("device {device_id}: {path} answered {}", resp.status);
                None
            }
            Err(e) => {
                debug!("device {device_id}: {path} failed: {e}");
                None
            }
        }
    }
}

/// Writes a probe outcome into a device.
///
/// An unreachable unit keeps its last known capabilities; only its status
/// changes.
fn apply_outcome(device: &mut Device, outcome: ProbeOutcome) {
    if outcome.reachable {
        device.status = ConnectionStatus::Connected;
        device.last_heartbeat = Some(Utc::now());
        device.capabilities = outcome.capabilities;
    } else {
        device.status = ConnectionStatus::Error;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
