//! Pairing of video frames with detection results
//!
//! Frames and results arrive on independent queues with independent
//! jitter. The [`Synchronizer`] buffers results keyed by their reference
//! sequence and, for each frame, picks the closest reference within the
//! tolerance window. When inference lags, the last consumed result is
//! held for a bounded number of frames so overlays fade out instead of
//! flickering. Matching is pure bookkeeping and never suspends; the
//! [`SyncPump`] is the async shell that feeds it from the queues.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use scopelink_core::config::SyncConfig;
use scopelink_core::{BoundedQueue, DetectionResult, VideoFrame};

use crate::latency::SyncFeedback;

/// How a frame's overlay was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncQuality {
    /// A result referenced this frame within the tolerance window.
    Exact,
    /// Reserved in the data model; the matcher does not produce it.
    Interpolated,
    /// An older consumed result is being held to bridge an inference gap.
    Held,
    /// No usable result; the frame renders without an overlay.
    None,
}

impl std::fmt::Display for SyncQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncQuality::Exact => "exact",
            SyncQuality::Interpolated => "interpolated",
            SyncQuality::Held => "held",
            SyncQuality::None => "none",
        };
        write!(f, "{s}")
    }
}

/// A frame paired with its overlay data, consumed once by the renderer.
#[derive(Debug, Clone)]
pub struct SyncedFrame {
    pub frame: VideoFrame,
    pub result: Option<DetectionResult>,
    pub quality: SyncQuality,
}

struct BufferedResult {
    result: DetectionResult,
    /// Arrival stamp for the most-recent tie-break.
    arrival: u64,
}

/// Matches frames to buffered detection results.
pub struct Synchronizer {
    tolerance: u64,
    capacity: usize,
    feedback: Arc<SyncFeedback>,
    buffered: BTreeMap<u64, BufferedResult>,
    next_arrival: u64,
    /// Most recently consumed result, reused while within the hold window.
    held: Option<DetectionResult>,
    /// Highest frame sequence already emitted; older frames are dropped.
    last_sequence: u64,
    late_frames: u64,
    overflow_dropped: u64,
}

impl Synchronizer {
    pub fn new(config: &SyncConfig, feedback: Arc<SyncFeedback>) -> Self {
        Self {
            tolerance: config.tolerance_frames,
            capacity: config.result_buffer_capacity,
            feedback,
            buffered: BTreeMap::new(),
            next_arrival: 0,
            held: None,
            last_sequence: 0,
            late_frames: 0,
            overflow_dropped: 0,
        }
    }

    /// Buffer a newly arrived result. A result for a reference already
    /// buffered replaces it; one staler than the drop window is counted
    /// and discarded.
    pub fn add_result(&mut self, result: DetectionResult) {
        if self.last_sequence > result.sequence + self.stale_window() {
            debug!(
                reference = result.sequence,
                position = self.last_sequence,
                "stale result dropped on arrival"
            );
            self.feedback.count_stale_result();
            return;
        }
        self.next_arrival += 1;
        let replaced = self.buffered.insert(
            result.sequence,
            BufferedResult {
                result,
                arrival: self.next_arrival,
            },
        );
        if replaced.is_some() {
            debug!("replacing buffered result for an already-seen reference");
        }
        while self.buffered.len() > self.capacity {
            self.buffered.pop_first();
            self.overflow_dropped += 1;
        }
    }

    /// Pair one frame with the best available result.
    ///
    /// Returns `None` for late frames (older than one already emitted);
    /// otherwise always yields a frame, with quality degrading from
    /// `Exact` through `Held` to `None`.
    pub fn match_frame(&mut self, frame: VideoFrame) -> Option<SyncedFrame> {
        if frame.sequence <= self.last_sequence {
            self.late_frames += 1;
            debug!(
                sequence = frame.sequence,
                newest = self.last_sequence,
                "late frame dropped"
            );
            return None;
        }
        self.prune_stale(frame.sequence);
        self.last_sequence = frame.sequence;

        if let Some(reference) = self.best_reference(frame.sequence) {
            if let Some(buffered) = self.buffered.remove(&reference) {
                self.held = Some(buffered.result.clone());
                return Some(SyncedFrame {
                    frame,
                    result: Some(buffered.result),
                    quality: SyncQuality::Exact,
                });
            }
        }

        let hold = self.feedback.hold_frames();
        if let Some(held) = &self.held {
            if frame.sequence > held.sequence && frame.sequence - held.sequence < hold {
                return Some(SyncedFrame {
                    frame,
                    result: Some(held.clone()),
                    quality: SyncQuality::Held,
                });
            }
        }

        Some(SyncedFrame {
            frame,
            result: None,
            quality: SyncQuality::None,
        })
    }

    /// Closest buffered reference within tolerance; exact distance ties
    /// go to the most recent arrival.
    fn best_reference(&self, sequence: u64) -> Option<u64> {
        let lo = sequence.saturating_sub(self.tolerance);
        let hi = sequence.saturating_add(self.tolerance);
        let mut best: Option<(u64, u64, u64)> = None;
        for (&reference, buffered) in self.buffered.range(lo..=hi) {
            let delta = sequence.abs_diff(reference);
            let better = match best {
                None => true,
                Some((_, best_delta, best_arrival)) => {
                    delta < best_delta || (delta == best_delta && buffered.arrival > best_arrival)
                }
            };
            if better {
                best = Some((reference, delta, buffered.arrival));
            }
        }
        best.map(|(reference, _, _)| reference)
    }

    fn prune_stale(&mut self, sequence: u64) {
        let window = self.stale_window();
        while let Some((&reference, _)) = self.buffered.first_key_value() {
            if sequence > reference + window {
                self.buffered.pop_first();
                self.feedback.count_stale_result();
            } else {
                break;
            }
        }
    }

    /// References this far behind the current frame can no longer match
    /// or be held, whichever window is wider.
    fn stale_window(&self) -> u64 {
        self.tolerance.max(self.feedback.hold_frames())
    }

    pub fn late_frames(&self) -> u64 {
        self.late_frames
    }

    pub fn buffered_results(&self) -> usize {
        self.buffered.len()
    }
}

/// Drives the synchronizer from the ingest queues to the render queue.
pub struct SyncPump {
    frames: Arc<BoundedQueue<VideoFrame>>,
    results: Arc<BoundedQueue<DetectionResult>>,
    out: Arc<BoundedQueue<SyncedFrame>>,
    sync: Synchronizer,
    feedback: Arc<SyncFeedback>,
    skipped_for_freshness: u64,
}

impl SyncPump {
    pub fn new(
        frames: Arc<BoundedQueue<VideoFrame>>,
        results: Arc<BoundedQueue<DetectionResult>>,
        out: Arc<BoundedQueue<SyncedFrame>>,
        config: &SyncConfig,
        feedback: Arc<SyncFeedback>,
    ) -> Self {
        Self {
            frames,
            results,
            out,
            sync: Synchronizer::new(config, Arc::clone(&feedback)),
            feedback,
            skipped_for_freshness: 0,
        }
    }

    /// Pump until the frame queue closes. The result queue closing alone
    /// only means no further overlays.
    pub async fn run(mut self) {
        let mut results_open = true;
        loop {
            tokio::select! {
                frame = self.frames.pop() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => break,
                },
                result = self.results.pop(), if results_open => match result {
                    Some(result) => self.sync.add_result(result),
                    None => results_open = false,
                },
            }
        }
        self.out.close();
        info!(
            late_frames = self.sync.late_frames(),
            skipped_for_freshness = self.skipped_for_freshness,
            "synchronizer finished"
        );
    }

    fn on_frame(&mut self, frame: VideoFrame) {
        // Results already queued must be visible before this frame is
        // matched, or a result racing its own frame would be missed.
        while let Some(result) = self.results.try_pop() {
            self.sync.add_result(result);
        }

        let mut frame = frame;
        if self.feedback.prefer_freshness() {
            while let Some(newer) = self.frames.try_pop() {
                self.skipped_for_freshness += 1;
                frame = newer;
            }
        }

        if let Some(synced) = self.sync.match_frame(frame) {
            self.out.push(synced);
        }
    }
}
