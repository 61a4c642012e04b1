//! Frame/result synchronization and overlay rendering
//!
//! The consuming half of the viewer: takes the decoded-frame and
//! detection-result queues the transport fills, pairs them, composes
//! overlays, and paces presentation at the display refresh rate.
//!
//! ```text
//! BoundedQueue<VideoFrame> ──┐
//!                            ├─ SyncPump ─ BoundedQueue<SyncedFrame>
//! BoundedQueue<DetectionResult>             │
//!                                           ▼
//!                    LatencyMonitor ◄── RenderLoop ──► DisplaySurface
//! ```
//!
//! The [`LatencyMonitor`] closes the loop: it measures capture-to-present
//! latency at the renderer and, through [`SyncFeedback`], tightens the
//! synchronizer's hold window when the budget is exceeded.

#![warn(clippy::all)]

pub mod latency;
pub mod render;
pub mod sync;

pub use latency::{LatencyMonitor, SyncFeedback};
pub use render::{compose, Composite, DisplaySurface, RenderLoop};
pub use sync::{SyncPump, SyncQuality, SyncedFrame, Synchronizer};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
