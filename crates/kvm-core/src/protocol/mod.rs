//! Wire vocabularies spoken by the gateway.
//!
//! - [`native`]: the REST surface exposed by each remote KVM unit (paths,
//!   request bodies, the power-action table).
//! - [`messages`]: the JSON frames exchanged with viewers over WebSocket.

pub mod messages;
pub mod native;

pub use messages::{GatewayEvent, SignalingRequest, StreamControlRequest};
pub use native::PowerAction;
