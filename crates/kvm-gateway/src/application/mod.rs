//! Application layer: everything the gateway *does*, independent of the
//! concrete HTTP client and WebSocket library.
//!
//! - **`registry`** – which units exist and what they can do.
//! - **`session`** – authenticated sessions and hardware commands.
//! - **`streaming`** – supervised per-device stream loops.
//! - **`fanout`** – topic-keyed delivery to viewer sockets.
//! - **`channels`** – the realtime WebSocket protocol.
//! - **`monitor`** – periodic status probing.
//! - **`gateway`** – wires the above together.
//! - **`collaborators`** – permission and audit seams.
//! - **`transport`** – the trait the HTTP client implements.

pub mod channels;
pub mod collaborators;
pub mod fanout;
pub mod gateway;
pub mod monitor;
pub mod registry;
pub mod session;
pub mod streaming;
pub mod transport;

pub use channels::{ChannelError, ChannelRoute, RealtimeChannel};
pub use collaborators::{
    AuditSink, PermissionGate, PermissionLevel, TracingAuditSink, TrustedUpstreamGate,
};
pub use fanout::{BroadcastReport, ConnectionFanout, FanoutError, Subscriber};
pub use gateway::{DeviceCommand, Gateway, DEVICE_EVENTS_TOPIC};
pub use monitor::StatusMonitor;
pub use registry::{DeviceRegistry, ProbeTimeouts};
pub use session::{AuthMode, HardwareSessionManager, SessionTimeouts};
pub use streaming::{StreamOrchestrator, StreamTimings};
pub use transport::{DeviceRequest, DeviceResponse, DeviceTransport, TransportFactory};
