//! Core types for the scopelink viewer
//!
//! Everything shared between the transport and rendering halves of the
//! client lives here: the frame and detection data model, the bounded
//! drop-oldest queues joining pipeline stages, configuration loading,
//! and the error taxonomy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  scopelink-webrtc (session, media ingest)           │
//! │     ↓ BoundedQueue<VideoFrame> / DetectionResult    │
//! │  scopelink-pipeline (sync, latency, render)         │
//! │     ↓ BoundedQueue<Composite>                       │
//! │  DisplaySurface (embedding GUI)                     │
//! └─────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod queue;

pub use config::{DataChannelMode, ViewerConfig};
pub use detection::{
    encode_detection_payload, parse_detection_payload, BoundingBox, Detection, DetectionResult,
};
pub use error::{Error, Result};
pub use frame::{EncodedPacket, PixelFormat, VideoDecoder, VideoFrame};
pub use queue::BoundedQueue;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
