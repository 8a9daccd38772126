//! Network backends for meshcall: a WebSocket signaling connector and a
//! WebRTC media backend.

pub mod backend;
pub mod signaling;

pub use backend::{CaptureConfig, SampleWriter, WebRtcBackend};
pub use signaling::WsSignalingConnector;
