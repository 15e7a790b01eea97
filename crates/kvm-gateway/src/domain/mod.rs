//! Domain layer for kvm-gateway.
//!
//! The device, stream and message types shared with other crates live in
//! `kvm-core`.  What remains here is gateway-specific: the configuration
//! file schema and its validation rules.

pub mod config;

pub use config::{
    load_config, parse_config, ConfigError, GatewayConfig, GatewaySettings, StreamingSettings,
    TimeoutSettings,
};
