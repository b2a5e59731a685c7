//! Capture loop: source → detector → association → counting worker → preview.
//!
//! The loop owns the frame cadence. A failing source is reopened forever with
//! exponential backoff; nothing downstream can stall it because detections are
//! handed over with `try_send` and frames land in the latest-wins buffer.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use video_ingest::{Frame, FrameSource};

use crate::{
    crossing::{Associator, CountingLine, CrossingHandle, DetectionBatch, TrackedDetection},
    error::Fault,
    frame_buffer::FrameBuffer,
    model::Detection,
    pipeline::{
        annotation::{Overlay, annotate_frame},
        config::CaptureConfig,
        telemetry,
        watchdog::{HealthComponent, PipelineHealth, WatchdogState},
    },
};

/// Longest single sleep so shutdown stays responsive.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Object detector run on every processed frame.
pub trait Detector: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
    Error,
}

impl CaptureStatus {
    pub fn label(self) -> &'static str {
        match self {
            CaptureStatus::Stopped => "stopped",
            CaptureStatus::Connecting => "connecting",
            CaptureStatus::Streaming => "streaming",
            CaptureStatus::Reconnecting => "reconnecting",
            CaptureStatus::Error => "error",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureStatus::Connecting,
            2 => CaptureStatus::Streaming,
            3 => CaptureStatus::Reconnecting,
            4 => CaptureStatus::Error,
            _ => CaptureStatus::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CaptureStatus::Stopped => 0,
            CaptureStatus::Connecting => 1,
            CaptureStatus::Streaming => 2,
            CaptureStatus::Reconnecting => 3,
            CaptureStatus::Error => 4,
        }
    }
}

/// Capture status and counters, written by the capture loop and read by snapshots.
#[derive(Debug, Default)]
pub struct CaptureMonitor {
    status: AtomicU8,
    frames_captured: AtomicU64,
    detections_total: AtomicU64,
    last_detection_count: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CaptureReport {
    pub status: CaptureStatus,
    pub frames_captured: u64,
    pub detections_total: u64,
    pub last_detection_count: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl CaptureMonitor {
    pub fn status(&self) -> CaptureStatus {
        CaptureStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn report(&self) -> CaptureReport {
        CaptureReport {
            status: self.status(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            last_detection_count: self.last_detection_count.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn set_status(&self, status: CaptureStatus) {
        let previous = self.status.swap(status.as_u8(), Ordering::Relaxed);
        if previous != status.as_u8() {
            debug!(status = status.label(), "capture status changed");
            metrics::gauge!("dock_capture_status").set(status.as_u8() as f64);
        }
    }

    fn record_frame(&self, detections: usize) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.detections_total
            .fetch_add(detections as u64, Ordering::Relaxed);
        self.last_detection_count
            .store(detections as u64, Ordering::Relaxed);
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dock_capture_reconnects_total").increment(1);
    }
}

/// Reconnect delay doubling per consecutive failure up to a cap.
#[derive(Debug)]
pub(crate) struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl ReconnectBackoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.base,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Everything the capture thread owns.
pub struct CaptureLoop {
    pub config: CaptureConfig,
    pub line: CountingLine,
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
    pub associator: Box<dyn Associator>,
    pub crossing: CrossingHandle,
    pub frames: Arc<FrameBuffer>,
    pub monitor: Arc<CaptureMonitor>,
    pub health: Arc<PipelineHealth>,
    pub watchdog: Arc<WatchdogState>,
    pub shutdown: Arc<AtomicBool>,
}

/// Spawn the capture loop on its own thread.
pub fn spawn_capture(capture: CaptureLoop) -> Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("dock-capture", move || capture.run())
        .context("failed to spawn capture thread")
}

impl CaptureLoop {
    pub fn run(mut self) {
        let source_name = self.source.describe().to_string();
        let _span = tracing::info_span!("capture", source = %source_name).entered();
        let mut backoff =
            ReconnectBackoff::new(self.config.reconnect_delay(), self.config.reconnect_max());
        let interval = self.config.frame_interval();
        let read_timeout = self.config.read_timeout();
        let mut next_due = Instant::now();
        let mut is_open = false;
        let mut ever_opened = false;

        while !self.shutdown.load(Ordering::Relaxed) {
            if self.watchdog.take_capture_restart() && is_open {
                warn!("watchdog requested capture restart; reopening source");
                self.source.close();
                is_open = false;
            }

            if !is_open {
                self.monitor.set_status(if ever_opened {
                    CaptureStatus::Reconnecting
                } else {
                    CaptureStatus::Connecting
                });
                match self.source.open() {
                    Ok(()) => {
                        info!(source = %source_name, "video source opened");
                        is_open = true;
                        ever_opened = true;
                        next_due = Instant::now();
                    }
                    Err(err) => {
                        Fault::CaptureFailure.record();
                        warn!(source = %source_name, "failed to open video source: {err}");
                        self.monitor.record_error(err.to_string());
                        self.monitor.set_status(CaptureStatus::Error);
                        ever_opened = true;
                        let delay = backoff.next_delay();
                        if !sleep_interruptible(delay, &self.shutdown) {
                            break;
                        }
                        self.monitor.record_reconnect();
                        continue;
                    }
                }
            }

            // Pace by waiting before the read; frames already pulled are never dropped.
            let now = Instant::now();
            if now < next_due {
                if !sleep_interruptible(next_due - now, &self.shutdown) {
                    break;
                }
                continue;
            }

            match self.source.next_frame(read_timeout) {
                Ok(frame) => {
                    let captured_at = Instant::now();
                    next_due = (next_due + interval).max(captured_at);
                    backoff.reset();
                    self.monitor.set_status(CaptureStatus::Streaming);
                    self.process_frame(frame, captured_at);
                }
                Err(err) => {
                    Fault::CaptureFailure.record();
                    warn!(source = %source_name, "frame read failed: {err}");
                    self.monitor.record_error(err.to_string());
                    self.monitor.set_status(CaptureStatus::Reconnecting);
                    self.source.close();
                    is_open = false;
                    let delay = backoff.next_delay();
                    if !sleep_interruptible(delay, &self.shutdown) {
                        break;
                    }
                    self.monitor.record_reconnect();
                }
            }
        }

        self.source.close();
        self.monitor.set_status(CaptureStatus::Stopped);
        info!("capture loop stopped");
    }

    /// Run one frame through detection, counting and the preview buffer.
    pub(crate) fn process_frame(&mut self, frame: Frame, captured_at: Instant) {
        let stage_start = Instant::now();
        let span = tracing::info_span!(
            "capture.frame",
            width = frame.width,
            height = frame.height,
            timestamp = frame.timestamp_ms,
            detections = tracing::field::Empty
        );
        let _guard = span.enter();
        self.health.beat(HealthComponent::Capture);

        let detections = match self.detector.infer(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                warn!("detector failed: {err:#}");
                metrics::counter!("dock_detector_errors_total").increment(1);
                Vec::new()
            }
        };
        span.record("detections", detections.len());

        let track_ids = self.associator.associate(&detections, captured_at);
        let gaps = track_ids.iter().filter(|id| id.is_none()).count();
        Fault::AssociationGap.record_n(gaps as u64);

        let tracked: Vec<TrackedDetection> = detections
            .iter()
            .zip(&track_ids)
            .filter_map(|(detection, id)| {
                id.map(|track_id| TrackedDetection {
                    track_id,
                    detection: detection.clone(),
                })
            })
            .collect();
        if !self.crossing.submit(DetectionBatch {
            frame_size: (frame.width, frame.height),
            captured_at,
            detections: tracked,
        }) {
            debug!("detection batch dropped; counting worker is behind");
        }

        let counting = self.crossing.snapshot();
        let overlay = Overlay {
            detections: &detections,
            track_ids: &track_ids,
            line: &self.line,
            inbound: counting.totals.inbound,
            outbound: counting.totals.outbound,
            fps: self.frames.stats().fps,
            counting_enabled: counting.enabled,
        };
        match annotate_frame(&frame, &overlay, self.config.clamped_jpeg_quality()) {
            Ok(jpeg) => {
                self.frames
                    .push(jpeg, frame.timestamp_ms, detections.len());
            }
            Err(err) => {
                warn!("failed to annotate frame: {err:#}");
                metrics::counter!("dock_encode_errors_total").increment(1);
            }
        }

        self.monitor.record_frame(detections.len());
        metrics::counter!("dock_frames_total").increment(1);
        metrics::gauge!("dock_capture_fps").set(self.frames.stats().fps as f64);
        metrics::histogram!("dock_stage_latency_seconds", "stage" => "capture")
            .record(stage_start.elapsed().as_secs_f64());
    }
}

/// Sleep in short slices; returns `false` when shutdown was requested.
fn sleep_interruptible(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
