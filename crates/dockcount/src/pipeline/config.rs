//! Configuration shared by every stage of the counting pipeline.
//!
//! The binary builds a `DockConfig` from an optional JSON file overlaid with
//! CLI flags and environment variables; downstream stages only read it.

use std::{fs, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{
    crossing::CrossingConfig,
    dispatch::DispatchConfig,
    frame_buffer::{MAX_HISTORY_DEPTH, MIN_HISTORY_DEPTH},
};

pub const MIN_JPEG_QUALITY: u8 = 30;
pub const MAX_JPEG_QUALITY: u8 = 95;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Canonical configuration for a single dock camera.
pub struct DockConfig {
    pub capture: CaptureConfig,
    pub crossing: CrossingConfig,
    pub dispatch: DispatchConfig,
    pub sync: SyncConfig,
    pub worker: WorkerConfig,
    #[serde(skip)]
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera URI, device path or index.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: f64,
    pub jpeg_quality: u8,
    pub reconnect_delay_secs: f64,
    pub reconnect_max_secs: f64,
    pub read_timeout_secs: f64,
    pub history_depth: usize,
    /// Minimum IoU for the built-in associator to reuse a track.
    pub association_iou: f32,
    pub association_max_age_secs: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "0".to_string(),
            width: 1280,
            height: 720,
            target_fps: 15.0,
            jpeg_quality: 65,
            reconnect_delay_secs: 2.0,
            reconnect_max_secs: 30.0,
            read_timeout_secs: 5.0,
            history_depth: MAX_HISTORY_DEPTH,
            association_iou: 0.3,
            association_max_age_secs: 2.0,
        }
    }
}

impl CaptureConfig {
    /// Minimum spacing between processed frames.
    pub fn frame_interval(&self) -> Duration {
        if self.target_fps > 0.0 {
            secs(1.0 / self.target_fps)
        } else {
            Duration::ZERO
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        secs(self.reconnect_delay_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        secs(self.reconnect_max_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        secs(self.read_timeout_secs)
    }

    pub fn association_max_age(&self) -> Duration {
        secs(self.association_max_age_secs)
    }

    pub fn clamped_jpeg_quality(&self) -> u8 {
        self.jpeg_quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: f64,
    /// Disable counting again when a controller that enabled it goes quiet.
    pub controller_idle_reset_secs: Option<f64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1.0,
            controller_idle_reset_secs: Some(300.0),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }

    pub fn controller_idle_reset(&self) -> Option<Duration> {
        self.controller_idle_reset_secs.map(secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Sizing for the counting worker.
pub struct WorkerConfig {
    pub crossing_queue_depth: usize,
    pub tick_interval_ms: u64,
    /// Producer silence after which the ticker judges timers against wall
    /// time. Must exceed the worst detector round-trip.
    pub tick_slack_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            crossing_queue_depth: 8,
            tick_interval_ms: 100,
            tick_slack_ms: 12_000,
        }
    }
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn tick_slack(&self) -> Duration {
        Duration::from_millis(self.tick_slack_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Optional telemetry knobs for tracing output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log level to `debug`.
    pub verbose: bool,
}

impl DockConfig {
    /// Load a JSON configuration file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.source.trim().is_empty() {
            bail!("capture source must not be empty");
        }
        if capture.width == 0 || capture.height == 0 {
            bail!("capture width and height must be positive");
        }
        if !(capture.target_fps > 0.0 && capture.target_fps <= 120.0) {
            bail!("target fps must be within (0, 120]");
        }
        if !(MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&capture.jpeg_quality) {
            bail!("jpeg quality must be between {MIN_JPEG_QUALITY} and {MAX_JPEG_QUALITY}");
        }
        if !(MIN_HISTORY_DEPTH..=MAX_HISTORY_DEPTH).contains(&capture.history_depth) {
            bail!(
                "frame history depth must be between {MIN_HISTORY_DEPTH} and {MAX_HISTORY_DEPTH}"
            );
        }
        if capture.reconnect_delay_secs <= 0.0
            || capture.reconnect_max_secs < capture.reconnect_delay_secs
        {
            bail!("reconnect delay must be positive and not exceed the reconnect cap");
        }
        if capture.read_timeout_secs <= 0.0 {
            bail!("read timeout must be positive");
        }

        let crossing = &self.crossing;
        for (name, value) in [
            ("persistence", crossing.persistence_secs),
            ("cooldown", crossing.cooldown_secs),
            ("silence", crossing.silence_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} window must be a non-negative number of seconds");
            }
        }
        if crossing.silence_secs <= crossing.persistence_secs {
            bail!("silence timeout must exceed the persistence window");
        }
        if !(0.0..=1.0).contains(&crossing.line.position) {
            bail!("counting line position must be within [0, 1]");
        }
        if !(0.0..0.5).contains(&crossing.line.dead_band) {
            bail!("counting line dead band must be within [0, 0.5)");
        }
        if crossing.counted_classes.is_empty() {
            bail!("at least one object class must be counted");
        }
        if crossing.max_tracks == 0 {
            bail!("track table capacity must be at least 1");
        }

        let dispatch = &self.dispatch;
        if dispatch.queue_capacity == 0 {
            bail!("sink queue capacity must be at least 1");
        }
        if dispatch.failure_threshold == 0 {
            bail!("breaker failure threshold must be at least 1");
        }
        if dispatch.max_rounds == 0 {
            bail!("delivery rounds must be at least 1");
        }
        if dispatch.open_secs <= 0.0 || dispatch.open_max_secs < dispatch.open_secs {
            bail!("breaker open duration must be positive and not exceed its cap");
        }

        if self.sync.interval_secs <= 0.0 {
            bail!("sync interval must be positive");
        }
        if self.worker.crossing_queue_depth == 0 {
            bail!("crossing queue depth must be at least 1");
        }
        Ok(())
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}
