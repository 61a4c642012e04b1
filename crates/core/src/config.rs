//! Viewer configuration.
//!
//! Loaded from a TOML file, then overridden by environment variables, then
//! validated. Every field has a default so an empty config is runnable
//! against a local broker.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for the viewer client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub session: SessionConfig,
    pub sync: SyncConfig,
    pub latency: LatencyConfig,
    pub render: RenderConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the signaling broker.
    pub url: String,
}

/// Connectivity configuration service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// HTTP endpoint returning the ICE server list.
    pub config_url: String,
    /// Fetch attempts before the session fails.
    pub fetch_attempts: u32,
    /// First retry delay. Doubles per attempt up to `max_backoff_ms`.
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Session negotiation timeouts and recovery bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for the remote answer after sending an offer.
    pub answer_timeout_secs: u64,
    /// How long candidate exchange may run before the transport must
    /// report connected.
    pub connect_timeout_secs: u64,
    /// Grace period for the transport to recover on its own after a
    /// disconnect, before we start restarting.
    pub ice_recovery_wait_secs: u64,
    /// Connectivity restarts attempted on the live transport.
    pub ice_restart_limit: u32,
    /// Full teardown-and-renegotiate cycles after restarts are exhausted.
    pub rebuild_limit: u32,
    /// Label of the data channel carrying detection results.
    pub data_channel_label: String,
    pub data_channel_mode: DataChannelMode,
}

/// Delivery mode for the detection data channel.
///
/// Unreliable is the default: a lost result is superseded by the next one
/// within tens of milliseconds, and a retransmitted stale result is worse
/// than none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelMode {
    Reliable,
    Unreliable,
}

impl DataChannelMode {
    pub fn ordered(&self) -> bool {
        matches!(self, DataChannelMode::Reliable)
    }

    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,
            DataChannelMode::Unreliable => Some(0),
        }
    }
}

/// Frame/result synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum sequence distance for a result to match a frame.
    pub tolerance_frames: u64,
    /// How many frames past its reference a consumed result keeps being
    /// shown when no fresher result exists.
    pub hold_frames: u64,
    /// Decoded frames buffered between decoder and synchronizer.
    pub frame_queue_capacity: usize,
    /// Unmatched results retained while their frame is in flight.
    pub result_buffer_capacity: usize,
}

/// End-to-end latency policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Capture-to-render budget. Sustained breaches trigger the
    /// degradation policy.
    pub budget_ms: u64,
    /// Smoothing factor for the running latency average.
    pub ewma_alpha: f64,
    /// Width of each histogram window in the latency report.
    pub window_secs: u64,
}

/// Overlay rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Display refresh rate driving the render loop.
    pub refresh_hz: u32,
    /// Bounding box outline thickness in pixels.
    pub box_thickness: u32,
    /// Per-label overlay colors as RGB triples.
    pub label_colors: HashMap<String, [u8; 3]>,
    /// Color for labels without an entry in `label_colors`.
    pub default_color: [u8; 3],
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            session: SessionConfig::default(),
            sync: SyncConfig::default(),
            latency: LatencyConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8443/signal".to_string(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            config_url: "http://127.0.0.1:8443/ice-config".to_string(),
            fetch_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            answer_timeout_secs: 25,
            connect_timeout_secs: 30,
            ice_recovery_wait_secs: 5,
            ice_restart_limit: 2,
            rebuild_limit: 1,
            data_channel_label: "detections".to_string(),
            data_channel_mode: DataChannelMode::Unreliable,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_frames: 2,
            hold_frames: 2,
            frame_queue_capacity: 8,
            result_buffer_capacity: 64,
        }
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            budget_ms: 200,
            ewma_alpha: 0.1,
            window_secs: 30,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        let mut label_colors = HashMap::new();
        label_colors.insert("cavity".to_string(), [220, 40, 40]);
        Self {
            refresh_hz: 30,
            box_thickness: 2,
            label_colors,
            default_color: [40, 200, 120],
        }
    }
}

impl ViewerConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: ViewerConfig = toml::from_str(&contents)
            .map_err(|e| Error::InvalidConfig(format!("parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Load from file (when given), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SCOPELINK_*` environment overrides for deploy-time knobs.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SCOPELINK_SIGNALING_URL") {
            self.signaling.url = url;
        }
        if let Ok(url) = std::env::var("SCOPELINK_ICE_CONFIG_URL") {
            self.ice.config_url = url;
        }
        if let Ok(v) = std::env::var("SCOPELINK_ANSWER_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.session.answer_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SCOPELINK_LATENCY_BUDGET_MS") {
            if let Ok(ms) = v.parse() {
                self.latency.budget_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SCOPELINK_SYNC_TOLERANCE") {
            if let Ok(frames) = v.parse() {
                self.sync.tolerance_frames = frames;
            }
        }
        if let Ok(v) = std::env::var("SCOPELINK_SYNC_HOLD_FRAMES") {
            if let Ok(frames) = v.parse() {
                self.sync.hold_frames = frames;
            }
        }
        if let Ok(v) = std::env::var("SCOPELINK_RENDER_REFRESH_HZ") {
            if let Ok(hz) = v.parse() {
                self.render.refresh_hz = hz;
            }
        }
    }

    /// Check all fields are within their working ranges.
    pub fn validate(&self) -> Result<()> {
        let signaling_url = url::Url::parse(&self.signaling.url)
            .map_err(|e| Error::InvalidConfig(format!("signaling.url: {e}")))?;
        if !matches!(signaling_url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "signaling.url must be ws:// or wss://, got {}",
                signaling_url.scheme()
            )));
        }

        let ice_url = url::Url::parse(&self.ice.config_url)
            .map_err(|e| Error::InvalidConfig(format!("ice.config_url: {e}")))?;
        if !matches!(ice_url.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "ice.config_url must be http:// or https://, got {}",
                ice_url.scheme()
            )));
        }
        if self.ice.fetch_attempts == 0 {
            return Err(Error::InvalidConfig(
                "ice.fetch_attempts must be at least 1".to_string(),
            ));
        }
        if self.ice.initial_backoff_ms == 0 || self.ice.max_backoff_ms < self.ice.initial_backoff_ms
        {
            return Err(Error::InvalidConfig(
                "ice backoff must satisfy 0 < initial <= max".to_string(),
            ));
        }

        if self.session.answer_timeout_secs == 0 || self.session.connect_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "session timeouts must be non-zero".to_string(),
            ));
        }
        if self.session.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "session.data_channel_label must be non-empty".to_string(),
            ));
        }

        if self.sync.tolerance_frames > 30 {
            return Err(Error::InvalidConfig(format!(
                "sync.tolerance_frames {} is too wide to be meaningful (max 30)",
                self.sync.tolerance_frames
            )));
        }
        if self.sync.frame_queue_capacity == 0 || self.sync.result_buffer_capacity == 0 {
            return Err(Error::InvalidConfig(
                "sync queue capacities must be non-zero".to_string(),
            ));
        }

        if self.latency.budget_ms == 0 {
            return Err(Error::InvalidConfig(
                "latency.budget_ms must be non-zero".to_string(),
            ));
        }
        if !(self.latency.ewma_alpha > 0.0 && self.latency.ewma_alpha <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "latency.ewma_alpha must be in (0, 1], got {}",
                self.latency.ewma_alpha
            )));
        }
        if self.latency.window_secs == 0 {
            return Err(Error::InvalidConfig(
                "latency.window_secs must be non-zero".to_string(),
            ));
        }

        if self.render.refresh_hz == 0 || self.render.refresh_hz > 240 {
            return Err(Error::InvalidConfig(format!(
                "render.refresh_hz must be in 1..=240, got {}",
                self.render.refresh_hz
            )));
        }
        if self.render.box_thickness == 0 || self.render.box_thickness > 16 {
            return Err(Error::InvalidConfig(format!(
                "render.box_thickness must be in 1..=16, got {}",
                self.render.box_thickness
            )));
        }

        Ok(())
    }
}
