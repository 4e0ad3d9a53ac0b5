//! ICE signaling: session state plus the relay that moves SDP and
//! candidates between a session's two sides.

pub mod relay;
pub mod session;

pub use relay::SignalingRelay;
