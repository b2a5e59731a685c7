//! Pipeline supervisor wiring capture, counting, delivery and sync together.
//!
//! Every stage runs on its own thread and talks to its neighbours through
//! bounded channels or published snapshots. Shutdown is staged: capture,
//! counting and sync stop first so that nothing is enqueued after the
//! delivery workers begin their final flush.

pub mod annotation;
pub mod capture;
pub mod config;
pub mod telemetry;
pub mod watchdog;

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use tracing::{info, warn};
use video_ingest::FrameSource;

pub use capture::{CaptureMonitor, CaptureReport, CaptureStatus, Detector};
pub use config::{CaptureConfig, DockConfig, SyncConfig, TelemetryOptions, WorkerConfig};

use crate::{
    crossing::{
        Associator, CrossingHandle, CrossingStateMachine, IouAssociator, spawn_crossing_worker,
    },
    dispatch::{DispatchQueue, Sink},
    frame_buffer::FrameBuffer,
    sync::{ControlSource, PollingSync, spawn_sync_loop},
};
use capture::{CaptureLoop, spawn_capture};
use watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog};

/// Collaborators plugged into the pipeline by the binary.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
    /// Defaults to the built-in IoU associator.
    pub associator: Option<Box<dyn Associator>>,
    pub sinks: Vec<Box<dyn Sink>>,
    pub control_sources: Vec<Box<dyn ControlSource>>,
}

/// Running pipeline. Dropping it without `stop` leaves threads running until
/// the shutdown flag is raised.
pub struct PipelineHandle {
    sync: Arc<PollingSync>,
    frames: Arc<FrameBuffer>,
    crossing: CrossingHandle,
    dispatch: Arc<DispatchQueue>,
    shutdown: Arc<AtomicBool>,
    dispatch_shutdown: Arc<AtomicBool>,
    stages: Vec<(&'static str, thread::JoinHandle<()>)>,
}

/// Install a Ctrl+C handler raising `shutdown`. Only the first call installs it.
pub fn install_ctrlc_handler(shutdown: Arc<AtomicBool>) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Start every stage. `shutdown` is the process-wide stop signal.
pub fn start(
    config: &DockConfig,
    parts: PipelineParts,
    shutdown: Arc<AtomicBool>,
) -> Result<PipelineHandle> {
    config.validate()?;

    let health = Arc::new(PipelineHealth::new());
    let watchdog_state = Arc::new(WatchdogState::new());
    let dispatch_shutdown = Arc::new(AtomicBool::new(false));
    let mut stages = Vec::new();

    if parts.sinks.is_empty() {
        warn!("no sinks configured; confirmed crossings are only counted locally");
        health.ignore(HealthComponent::Dispatch);
    }
    let dispatch = Arc::new(DispatchQueue::start(
        config.dispatch.clone(),
        parts.sinks,
        health.clone(),
        dispatch_shutdown.clone(),
    )?);

    let (crossing, crossing_join) = spawn_crossing_worker(
        CrossingStateMachine::new(config.crossing.clone()),
        config.worker.crossing_queue_depth,
        config.worker.tick_interval(),
        config.worker.tick_slack(),
        dispatch.clone(),
        health.clone(),
        shutdown.clone(),
    )?;
    stages.push(("crossing", crossing_join));

    let frames = Arc::new(FrameBuffer::new(config.capture.history_depth));
    let monitor = Arc::new(CaptureMonitor::default());
    let associator = parts.associator.unwrap_or_else(|| {
        Box::new(IouAssociator::new(
            config.capture.association_iou,
            config.capture.association_max_age(),
        ))
    });
    let capture_join = spawn_capture(CaptureLoop {
        config: config.capture.clone(),
        line: config.crossing.line,
        source: parts.source,
        detector: parts.detector,
        associator,
        crossing: crossing.clone(),
        frames: frames.clone(),
        monitor: monitor.clone(),
        health: health.clone(),
        watchdog: watchdog_state.clone(),
        shutdown: shutdown.clone(),
    })?;
    stages.insert(0, ("capture", capture_join));

    let sync = Arc::new(PollingSync::new(
        frames.clone(),
        crossing.clone(),
        dispatch.clone(),
        monitor,
        watchdog_state.clone(),
        config.sync.controller_idle_reset(),
    ));
    stages.push((
        "sync",
        spawn_sync_loop(
            sync.clone(),
            parts.control_sources,
            config.sync.interval(),
            health.clone(),
            shutdown.clone(),
        )?,
    ));
    stages.push((
        "watchdog",
        spawn_watchdog(health, watchdog_state, shutdown.clone())?,
    ));

    info!(
        source = %config.capture.source,
        target_fps = config.capture.target_fps,
        persistence_secs = config.crossing.persistence_secs,
        cooldown_secs = config.crossing.cooldown_secs,
        sinks = dispatch.health().len(),
        "counting pipeline started"
    );

    Ok(PipelineHandle {
        sync,
        frames,
        crossing,
        dispatch,
        shutdown,
        dispatch_shutdown,
        stages,
    })
}

impl PipelineHandle {
    pub fn sync(&self) -> &Arc<PollingSync> {
        &self.sync
    }

    pub fn frames(&self) -> &Arc<FrameBuffer> {
        &self.frames
    }

    pub fn crossing(&self) -> &CrossingHandle {
        &self.crossing
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Block until the shutdown flag is raised, then stop every stage.
    pub fn wait(self) {
        while !self.is_shutting_down() {
            thread::sleep(Duration::from_millis(200));
        }
        self.stop();
    }

    /// Stop the stages in order and wait for the delivery flush.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for (name, handle) in self.stages {
            if handle.join().is_err() {
                warn!(stage = name, "stage panicked during shutdown");
            }
        }
        self.dispatch_shutdown.store(true, Ordering::SeqCst);
        self.dispatch.join();
        info!(
            dead_letters = self.dispatch.dead_letters(),
            "counting pipeline stopped"
        );
    }
}
