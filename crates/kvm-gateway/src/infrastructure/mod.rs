//! Infrastructure layer for kvm-gateway.
//!
//! The infrastructure layer handles all I/O: HTTP calls to the KVM units and
//! WebSocket connections from viewers.
//!
//! # Responsibilities
//!
//! - Building one `reqwest` client per unit and mapping network failures
//!   to `GatewayError::Connectivity`
//! - Binding the WebSocket listener and performing the upgrade handshake
//! - Spawning per-socket tokio tasks
//! - Handling the graceful shutdown signal
//!
//! # What does NOT belong here?
//!
//! - Command, streaming and fanout logic (that is the application layer)
//! - Configuration parsing (that is the domain layer)
//!
//! `mock` holds the in-memory doubles used by unit and integration tests.

pub mod http_transport;
pub mod mock;
pub mod ws_server;

pub use http_transport::{HttpDeviceTransport, HttpTransportFactory};
pub use ws_server::{run_server, serve};
