pub mod webrtc;

pub use webrtc::NegotiationEngine;
