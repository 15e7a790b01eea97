//! kvm-gateway library crate.
//!
//! This crate runs the gateway that sits between many operators and many
//! remote KVM-over-IP units.  It authenticates to each unit, dispatches
//! power / keyboard / mouse / video commands to it, and fans out live
//! status and video to every viewer of that unit.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Viewers (JSON over WebSocket)          Operators (API layer, external)
//!         ↕                                        ↓
//! [kvm-gateway]
//!   ├── domain/           GatewayConfig (TOML + CLI overrides)
//!   ├── application/      DeviceRegistry, HardwareSessionManager,
//!   │                     StreamOrchestrator, ConnectionFanout,
//!   │                     realtime channels, StatusMonitor
//!   └── infrastructure/
//!         ├── http_transport/ reqwest client for each unit's REST API
//!         ├── ws_server/      WebSocket accept loop (tokio-tungstenite)
//!         └── mock/           in-memory units and sockets for tests
//!         ↓
//! Remote KVM units (HTTP REST)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O beyond reading the config file it is handed.
//! - `application` depends on `domain` and `kvm-core`; it reaches devices
//!   and sockets only through the `DeviceTransport` and `Subscriber` traits.
//! - `infrastructure` implements those traits with real sockets.
//!
//! # For beginners: why this structure?
//!
//! Every interesting behaviour (capability gating, chord ordering, stream
//! supervision, broadcast pruning) lives in `application` and can be tested
//! with the in-memory doubles from `infrastructure::mock`, without a real
//! KVM unit or browser.

/// Domain layer: configuration types (no network I/O).
pub mod domain;

/// Application layer: device registry, sessions, streaming and fanout.
pub mod application;

/// Infrastructure layer: HTTP transport, WebSocket server, test doubles.
pub mod infrastructure;
