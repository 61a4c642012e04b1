//! End-to-end latency tracking and the degradation policy
//!
//! The render loop records capture-to-present latency per frame. An EWMA
//! drives an advisory policy with hysteresis: when the average exceeds the
//! budget the synchronizer is told to shrink its hold window and prefer
//! fresh frames over complete ones; when it falls back under 80% of the
//! budget the defaults are restored. Percentiles come from an HDR
//! histogram over a rotating window. The monitor never blocks rendering.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tracing::{info, warn};

use scopelink_core::config::{LatencyConfig, SyncConfig};
use scopelink_core::{Error, Result};

/// Histogram range cap, 1 second in microseconds.
const MAX_TRACKED_US: u64 = 1_000_000;

/// Ratio of the budget below which the degradation policy disengages.
const RESTORE_RATIO: f64 = 0.8;

/// Shared knobs between the latency monitor and the synchronizer.
///
/// The monitor writes, the synchronizer reads, and the synchronizer
/// reports stale-result drops back through the counter here.
#[derive(Debug)]
pub struct SyncFeedback {
    hold_frames: AtomicU64,
    prefer_freshness: AtomicBool,
    stale_results: AtomicU64,
}

impl SyncFeedback {
    pub fn new(hold_frames: u64) -> Self {
        Self {
            hold_frames: AtomicU64::new(hold_frames),
            prefer_freshness: AtomicBool::new(false),
            stale_results: AtomicU64::new(0),
        }
    }

    /// Current hold window in frames.
    pub fn hold_frames(&self) -> u64 {
        self.hold_frames.load(Ordering::Relaxed)
    }

    /// Whether the pump should drain frame backlog to the newest frame.
    pub fn prefer_freshness(&self) -> bool {
        self.prefer_freshness.load(Ordering::Relaxed)
    }

    pub fn count_stale_result(&self) {
        self.stale_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_results(&self) -> u64 {
        self.stale_results.load(Ordering::Relaxed)
    }

    pub(crate) fn set_hold_frames(&self, hold: u64) {
        self.hold_frames.store(hold, Ordering::Relaxed);
    }

    pub(crate) fn set_prefer_freshness(&self, engaged: bool) {
        self.prefer_freshness.store(engaged, Ordering::Relaxed);
    }
}

struct WindowState {
    histogram: Histogram<u64>,
    started: Instant,
}

/// Capture-to-present latency monitor.
///
/// `record_*` is called from the render loop only; readers may query
/// from any task.
pub struct LatencyMonitor {
    budget_us: u64,
    restore_us: u64,
    alpha: f64,
    window: Duration,
    ewma_us: AtomicU64,
    engaged: AtomicBool,
    frames: AtomicU64,
    state: Mutex<WindowState>,
    base_hold: u64,
    shrunk_hold: u64,
    feedback: Arc<SyncFeedback>,
}

impl LatencyMonitor {
    pub fn new(latency: &LatencyConfig, sync: &SyncConfig) -> Result<Self> {
        let histogram = Histogram::<u64>::new_with_max(MAX_TRACKED_US, 3)
            .map_err(|e| Error::InvalidConfig(format!("latency histogram: {e}")))?;
        let budget_us = latency.budget_ms * 1000;
        Ok(Self {
            budget_us,
            restore_us: (budget_us as f64 * RESTORE_RATIO) as u64,
            alpha: latency.ewma_alpha,
            window: Duration::from_secs(latency.window_secs),
            ewma_us: AtomicU64::new(0),
            engaged: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            state: Mutex::new(WindowState {
                histogram,
                started: Instant::now(),
            }),
            base_hold: sync.hold_frames,
            shrunk_hold: sync.hold_frames / 2,
            feedback: Arc::new(SyncFeedback::new(sync.hold_frames)),
        })
    }

    pub fn feedback(&self) -> Arc<SyncFeedback> {
        Arc::clone(&self.feedback)
    }

    /// Record a just-presented frame by its capture timestamp.
    pub fn record_presented(&self, capture_ts_us: i64) {
        let latency = (unix_micros_now() - capture_ts_us).max(0) as u64;
        self.record_latency_us(latency);
    }

    /// Record one capture-to-present sample.
    pub fn record_latency_us(&self, latency_us: u64) {
        let clamped = latency_us.clamp(1, MAX_TRACKED_US);
        {
            let mut state = self.state.lock();
            if state.started.elapsed() >= self.window {
                state.histogram.reset();
                state.started = Instant::now();
            }
            state.histogram.record(clamped).ok();
        }
        self.frames.fetch_add(1, Ordering::Relaxed);

        let prev = self.ewma_us.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            clamped as f64
        } else {
            self.alpha * clamped as f64 + (1.0 - self.alpha) * prev as f64
        };
        self.ewma_us.store(avg.round() as u64, Ordering::Relaxed);
        self.apply_policy(avg);
    }

    fn apply_policy(&self, avg_us: f64) {
        let engaged = self.engaged.load(Ordering::Relaxed);
        if !engaged && avg_us > self.budget_us as f64 {
            self.engaged.store(true, Ordering::Relaxed);
            self.feedback.set_hold_frames(self.shrunk_hold);
            self.feedback.set_prefer_freshness(true);
            warn!(
                avg_ms = avg_us / 1000.0,
                budget_ms = self.budget_us / 1000,
                hold_frames = self.shrunk_hold,
                "latency over budget, preferring freshness"
            );
        } else if engaged && avg_us < self.restore_us as f64 {
            self.engaged.store(false, Ordering::Relaxed);
            self.feedback.set_hold_frames(self.base_hold);
            self.feedback.set_prefer_freshness(false);
            info!(
                avg_ms = avg_us / 1000.0,
                hold_frames = self.base_hold,
                "latency back under budget"
            );
        }
    }

    /// Running average latency in microseconds.
    pub fn average_us(&self) -> u64 {
        self.ewma_us.load(Ordering::Relaxed)
    }

    /// Whether the degradation policy is currently engaged.
    pub fn is_degraded(&self) -> bool {
        self.engaged.load(Ordering::Relaxed)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Latency at the given quantile within the current window.
    pub fn percentile_us(&self, q: f64) -> u64 {
        self.state.lock().histogram.value_at_quantile(q)
    }

    /// Text exposition of the monitor state, one metric per line.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for q in [0.5, 0.95, 0.99] {
            out.push_str(&format!(
                "viewer_frame_latency_us{{quantile=\"{q}\"}} {}\n",
                self.percentile_us(q)
            ));
        }
        out.push_str(&format!(
            "viewer_frame_latency_ewma_us {}\n",
            self.average_us()
        ));
        out.push_str(&format!("viewer_latency_budget_us {}\n", self.budget_us));
        out.push_str(&format!(
            "viewer_latency_degraded {}\n",
            u8::from(self.is_degraded())
        ));
        out.push_str(&format!(
            "viewer_frames_presented {}\n",
            self.frames_presented()
        ));
        out.push_str(&format!(
            "viewer_stale_results_dropped {}\n",
            self.feedback.stale_results()
        ));
        out
    }
}

fn unix_micros_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(budget_ms: u64, alpha: f64) -> LatencyMonitor {
        let latency = LatencyConfig {
            budget_ms,
            ewma_alpha: alpha,
            window_secs: 30,
        };
        LatencyMonitor::new(&latency, &SyncConfig::default()).unwrap()
    }

    #[test]
    fn test_ewma_tracks_samples() {
        let m = monitor(10_000, 0.5);
        m.record_latency_us(100_000);
        assert_eq!(m.average_us(), 100_000);
        m.record_latency_us(200_000);
        assert_eq!(m.average_us(), 150_000);
        assert_eq!(m.frames_presented(), 2);
    }

    #[test]
    fn test_policy_engages_and_restores_with_hysteresis() {
        // alpha 1.0 makes the average follow the last sample exactly.
        let m = monitor(100, 1.0);
        let feedback = m.feedback();
        assert_eq!(feedback.hold_frames(), 2);

        m.record_latency_us(150_000);
        assert!(m.is_degraded());
        assert!(feedback.prefer_freshness());
        assert_eq!(feedback.hold_frames(), 1);

        // Between restore threshold (80ms) and budget: stays engaged.
        m.record_latency_us(90_000);
        assert!(m.is_degraded());

        m.record_latency_us(70_000);
        assert!(!m.is_degraded());
        assert!(!feedback.prefer_freshness());
        assert_eq!(feedback.hold_frames(), 2);
    }

    #[test]
    fn test_percentiles_from_window() {
        let m = monitor(1_000, 0.1);
        for ms in 1..=100u64 {
            m.record_latency_us(ms * 1000);
        }
        let p50 = m.percentile_us(0.5);
        assert!((45_000..=55_000).contains(&p50), "p50 was {p50}");
        let p99 = m.percentile_us(0.99);
        assert!(p99 >= 95_000, "p99 was {p99}");
    }

    #[test]
    fn test_report_lines() {
        let m = monitor(200, 0.1);
        m.record_latency_us(42_000);
        m.feedback().count_stale_result();
        let report = m.report();
        assert!(report.contains("viewer_frame_latency_us{quantile=\"0.5\"}"));
        assert!(report.contains("viewer_latency_budget_us 200000"));
        assert!(report.contains("viewer_stale_results_dropped 1"));
        assert!(report.contains("viewer_frames_presented 1"));
    }

    #[test]
    fn test_samples_clamped_to_histogram_range() {
        let m = monitor(200, 1.0);
        m.record_latency_us(30_000_000);
        assert_eq!(m.average_us(), MAX_TRACKED_US);
        // Histogram may round the top bucket slightly.
        assert!(m.percentile_us(0.99) <= MAX_TRACKED_US + MAX_TRACKED_US / 100);
    }
}
