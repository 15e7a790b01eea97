//! # kvm-core
//!
//! Shared library for the KVM-Over-IP gateway containing the device and
//! stream domain types, the key-chord expansion rules, the remote device
//! REST vocabulary, and the JSON realtime protocol.
//!
//! This crate is used by the gateway service and by anything that needs to
//! speak its realtime protocol (test harnesses, the API layer in front of
//! it).  It has zero dependencies on sockets, HTTP clients, or async
//! runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! The gateway sits between many operators and many remote KVM units.  Each
//! unit exposes its own REST API for power control (ATX), keyboard/mouse
//! (HID), video snapshots (streamer), and virtual media (MSD).  The gateway
//! authenticates to each unit, dispatches commands to it, and fans out live
//! video and status to every viewer of that unit.
//!
//! This crate (`kvm-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Pure data: devices and their capability flags, stream
//!   configurations and descriptors, and the uniform command result record.
//!
//! - **`keymap`** – How a list of key names becomes an ordered sequence of
//!   press and release events, and how friendly names map onto the
//!   `KeyboardEvent.code` strings the devices expect.
//!
//! - **`protocol`** – Both wire vocabularies: `native` (the device REST
//!   paths, bodies and power-action table) and `messages` (the JSON frames
//!   exchanged with viewers over WebSocket).
//!
//! - **`error`** – The error taxonomy shared by every layer.

pub mod domain;
pub mod error;
pub mod keymap;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `kvm_core::StreamConfig` instead of `kvm_core::domain::stream::StreamConfig`.
pub use domain::command::{CommandFailure, CommandResult, Snapshot};
pub use domain::device::{
    Capabilities, Capability, ConnectionStatus, Credentials, Device, DeviceConfig,
    DeviceEndpoint, DeviceId, DeviceStatusReport, Scheme,
};
pub use domain::stream::{
    StreamConfig, StreamDescriptor, StreamKey, StreamQuality, StreamState, StreamType,
};
pub use error::{ErrorKind, GatewayError};
pub use protocol::messages::GatewayEvent;
pub use protocol::native::PowerAction;
