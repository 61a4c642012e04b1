//! Peer media transport for the viewer
//!
//! Everything between the signaling broker and the rendering pipeline:
//!
//! - Signaling message types and the [`SignalingChannel`] trait, with an
//!   in-process broker for tests and a WebSocket bridge for deployment.
//! - The ICE configuration client.
//! - [`PeerTransport`] over webrtc-rs: one receive-only video transceiver
//!   plus a data channel carrying detection results.
//! - The [`Negotiator`] state machine driving one offer/answer exchange,
//!   including bounded restart recovery.
//! - [`SessionManager`], owning session tasks and peer rebuild cycles.
//! - [`MediaIngest`], turning the packet stream into stamped frames.
//!
//! The manager emits [`SessionEvent`]s; media flows out through the
//! bounded queues in [`SessionMedia`].

#![warn(clippy::all)]

pub mod ice;
pub mod ingest;
pub mod negotiator;
pub mod peer;
pub mod session;
pub mod signaling;

pub use ice::{IceConfigFetcher, IceProvider};
pub use ingest::{encode_raw_frame, MediaIngest, PassthroughDecoder};
pub use negotiator::{NegotiationOutcome, NegotiationState, Negotiator};
pub use peer::{MediaSink, PeerEvent, PeerFactory, PeerState, PeerTransport, WebRtcPeerFactory};
pub use session::{SessionEvent, SessionManager, SessionMedia};
pub use signaling::{
    CandidatePayload, InProcessBroker, SdpPayload, SessionSignal, SignalKind, SignalingChannel,
    SignalingMessage, WebSocketSignaling,
};

/// Crate version, for startup logs.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_not_empty() {
        assert!(!super::version().is_empty());
    }
}
