//! Broker signaling
//!
//! Wire protocol for the session exchange, the channel abstraction the
//! negotiator runs against, and the WebSocket transport used in
//! production.

pub mod channel;
pub mod messages;
pub mod websocket;

pub use channel::{InProcessBroker, InProcessChannel, SignalingChannel};
pub use messages::{CandidatePayload, SdpPayload, SessionSignal, SignalKind, SignalingMessage};
pub use websocket::WebSocketSignaling;
