//! KVM gateway: entry point.
//!
//! This binary loads the gateway configuration, registers every unit listed
//! in it, starts the status monitor and then serves the realtime WebSocket
//! channels until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! kvm-gateway [OPTIONS]
//!
//! Options:
//!   --config <PATH>            TOML configuration file
//!   --bind <ADDR>              WebSocket bind address (overrides the file)
//!   --port <PORT>              WebSocket port (overrides the file)
//!   --log-level <FILTER>       tracing filter used when RUST_LOG is unset
//!   --status-interval <SECS>   Seconds between status sweeps
//!   --accept-invalid-certs <BOOL>
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                          | Flag                      |
//! |-----------------------------------|---------------------------|
//! | `KVM_GATEWAY_CONFIG`              | `--config`                |
//! | `KVM_GATEWAY_BIND`                | `--bind`                  |
//! | `KVM_GATEWAY_PORT`                | `--port`                  |
//! | `KVM_GATEWAY_LOG`                 | `--log-level`             |
//! | `KVM_GATEWAY_STATUS_INTERVAL`     | `--status-interval`       |
//! | `KVM_GATEWAY_ACCEPT_INVALID_CERTS`| `--accept-invalid-certs`  |
//!
//! Precedence is CLI flag, then environment variable, then config file,
//! then built-in default.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kvm_gateway::application::{Gateway, StatusMonitor, TracingAuditSink, TrustedUpstreamGate};
use kvm_gateway::domain::{load_config, GatewayConfig};
use kvm_gateway::infrastructure::{run_server, HttpTransportFactory};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Gateway between operators and remote KVM-over-IP units.
#[derive(Debug, Parser)]
#[command(
    name = "kvm-gateway",
    about = "Operates remote KVM-over-IP units and fans out their video and status",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  Defaults apply when omitted.
    #[arg(long, env = "KVM_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// IP address the WebSocket listener binds to.
    #[arg(long, env = "KVM_GATEWAY_BIND")]
    bind: Option<String>,

    /// TCP port of the WebSocket listener.
    #[arg(long, env = "KVM_GATEWAY_PORT")]
    port: Option<u16>,

    /// `tracing` filter used when `RUST_LOG` is unset (e.g. `debug`).
    #[arg(long, env = "KVM_GATEWAY_LOG")]
    log_level: Option<String>,

    /// Seconds between status-monitor sweeps.
    #[arg(long, env = "KVM_GATEWAY_STATUS_INTERVAL")]
    status_interval: Option<u64>,

    /// Accept self-signed TLS certificates from units.
    #[arg(long, env = "KVM_GATEWAY_ACCEPT_INVALID_CERTS")]
    accept_invalid_certs: Option<bool>,
}

impl Cli {
    /// Loads the config file and applies every flag that was given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// result (after overrides) fails validation.
    fn into_gateway_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = load_config(self.config.as_deref()).with_context(|| match &self.config {
            Some(path) => format!("cannot load config from {}", path.display()),
            None => "cannot build default config".to_string(),
        })?;

        let g = &mut config.gateway;
        if let Some(bind) = self.bind {
            g.bind_address = bind;
        }
        if let Some(port) = self.port {
            g.ws_port = port;
        }
        if let Some(level) = self.log_level {
            g.log_level = level;
        }
        if let Some(secs) = self.status_interval {
            g.status_interval_secs = secs;
        }
        if let Some(accept) = self.accept_invalid_certs {
            g.accept_invalid_certs = accept;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed and merged over the config file.
/// 2. `tracing_subscriber` is initialised; `RUST_LOG` wins over the
///    configured `log_level`.
/// 3. Every configured unit is registered (probed once).
/// 4. The status monitor and the Ctrl+C handler are spawned.
/// 5. [`run_server`] serves WebSocket channels until the shutdown flag is
///    cleared, after which all streams, sessions and sockets are closed.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_gateway_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    let fallback = config.gateway.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();

    let listen_addr = config.gateway.listen_addr()?;
    info!(
        "KVM gateway starting: ws={listen_addr}, devices={}",
        config.devices.len()
    );

    // ── Wiring ────────────────────────────────────────────────────────────────
    let gateway = Gateway::new(
        &config,
        Arc::new(HttpTransportFactory::new(config.gateway.accept_invalid_certs)),
        Arc::new(TrustedUpstreamGate),
        Arc::new(TracingAuditSink),
    );

    for device in config.devices.iter().cloned() {
        let id = device.id.clone();
        if !gateway.register_device(device).await {
            warn!("device {id} did not respond at startup and was not registered");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = StatusMonitor::new(Arc::clone(&gateway), config.gateway.status_interval())
        .spawn(shutdown_rx);

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    // ── Main server loop ──────────────────────────────────────────────────────
    let served = run_server(Arc::clone(&gateway), listen_addr, running).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor.await {
        warn!("status monitor task ended abnormally: {e}");
    }
    gateway.shutdown().await;

    served?;
    info!("KVM gateway stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
