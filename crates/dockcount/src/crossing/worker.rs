//! Counting worker: the single owner of the track table.
//!
//! Detection batches arrive from the capture loop, control commands from the
//! sync layer, and a ticker resolves persistence timers even when no
//! detections arrive. Confirmed events are handed to the dispatch queue.
//!
//! Batches are stamped before detection, so a batch can still be in flight
//! when its capture instant is already in the past. The ticker therefore
//! judges timers against the newest capture instant processed and only falls
//! back to wall time once the producer has been quiet for a while.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, never, select, tick};
use tracing::{debug, warn};

use crate::{
    crossing::machine::{
        ControlCommand, CountingSnapshot, CrossingStateMachine, DetectionBatch,
    },
    dispatch::DispatchQueue,
    error::ControlError,
    pipeline::{
        telemetry,
        watchdog::{HealthComponent, PipelineHealth},
    },
    sync::SnapshotCell,
};

/// Unconfirmed tracks evicted for every detection batch the capture loop had to drop.
const SHED_PER_DROPPED_BATCH: usize = 4;
const CONTROL_QUEUE_DEPTH: usize = 16;

/// Instant up to which the ticker may resolve persistence timers.
#[derive(Debug)]
struct TickHorizon {
    slack: Duration,
    watermark: Option<Instant>,
    last_arrival: Option<Instant>,
}

impl TickHorizon {
    fn new(slack: Duration) -> Self {
        Self {
            slack,
            watermark: None,
            last_arrival: None,
        }
    }

    fn record(&mut self, captured_at: Instant, arrived: Instant) {
        self.watermark = Some(match self.watermark {
            Some(watermark) => watermark.max(captured_at),
            None => captured_at,
        });
        self.last_arrival = Some(arrived);
    }

    fn horizon(&self, now: Instant) -> Option<Instant> {
        let quiet = self
            .last_arrival
            .is_none_or(|at| now.saturating_duration_since(at) > self.slack);
        let fallback = if quiet { now.checked_sub(self.slack) } else { None };
        match (self.watermark, fallback) {
            (Some(watermark), Some(fallback)) => Some(watermark.max(fallback)),
            (watermark, fallback) => watermark.or(fallback),
        }
    }
}

/// Producer-side handle shared by the capture loop and controllers.
#[derive(Clone)]
pub struct CrossingHandle {
    detections: Sender<DetectionBatch>,
    control: Sender<ControlCommand>,
    shed_requests: Arc<AtomicU64>,
    snapshot: Arc<SnapshotCell<CountingSnapshot>>,
}

impl CrossingHandle {
    /// Hand a batch to the counting worker without blocking.
    ///
    /// When the worker is behind the batch is dropped and the worker is asked
    /// to shed its oldest unconfirmed tracks instead of stalling capture.
    pub fn submit(&self, batch: DetectionBatch) -> bool {
        match self.detections.try_send(batch) {
            Ok(()) => {
                metrics::gauge!("dock_queue_depth", "queue" => "crossing")
                    .set(self.detections.len() as f64);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.shed_requests.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("dock_detection_batches_dropped_total").increment(1);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn send_control(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.control.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => ControlError::Busy,
            TrySendError::Disconnected(_) => ControlError::Stopped,
        })
    }

    pub fn snapshot(&self) -> Arc<CountingSnapshot> {
        self.snapshot.load()
    }

    /// Handle with no worker behind it; the returned receiver sees submitted batches.
    #[cfg(test)]
    pub(crate) fn detached(queue_depth: usize) -> (Self, Receiver<DetectionBatch>) {
        let (detections, detections_rx) = bounded(queue_depth.max(1));
        let (control, _) = bounded(CONTROL_QUEUE_DEPTH);
        let handle = Self {
            detections,
            control,
            shed_requests: Arc::new(AtomicU64::new(0)),
            snapshot: Arc::new(SnapshotCell::new(CountingSnapshot::default())),
        };
        (handle, detections_rx)
    }
}

/// Spawn the counting worker and return the handle feeding it.
pub fn spawn_crossing_worker(
    machine: CrossingStateMachine,
    queue_depth: usize,
    tick_interval: Duration,
    tick_slack: Duration,
    dispatch: Arc<DispatchQueue>,
    health: Arc<PipelineHealth>,
    shutdown: Arc<AtomicBool>,
) -> Result<(CrossingHandle, thread::JoinHandle<()>)> {
    let (detections_tx, detections_rx) = bounded(queue_depth.max(1));
    let (control_tx, control_rx) = bounded(CONTROL_QUEUE_DEPTH);
    let shed_requests = Arc::new(AtomicU64::new(0));
    let snapshot = Arc::new(SnapshotCell::new(machine.snapshot()));

    let handle = CrossingHandle {
        detections: detections_tx,
        control: control_tx,
        shed_requests: shed_requests.clone(),
        snapshot: snapshot.clone(),
    };

    let worker = CrossingWorker {
        machine,
        detections: detections_rx,
        control: control_rx,
        shed_requests,
        snapshot,
        horizon: TickHorizon::new(tick_slack),
        dispatch,
        health,
        shutdown,
    };
    let join = telemetry::spawn_thread("dock-crossing", move || worker.run(tick_interval))
        .context("failed to spawn crossing worker")?;
    Ok((handle, join))
}

struct CrossingWorker {
    machine: CrossingStateMachine,
    detections: Receiver<DetectionBatch>,
    control: Receiver<ControlCommand>,
    shed_requests: Arc<AtomicU64>,
    snapshot: Arc<SnapshotCell<CountingSnapshot>>,
    horizon: TickHorizon,
    dispatch: Arc<DispatchQueue>,
    health: Arc<PipelineHealth>,
    shutdown: Arc<AtomicBool>,
}

impl CrossingWorker {
    fn run(mut self, tick_interval: Duration) {
        let ticker = tick(tick_interval);
        let mut control = self.control.clone();
        let mut detections = self.detections.clone();

        while !self.shutdown.load(Ordering::Relaxed) {
            let mut control_closed = false;
            let mut detections_closed = false;
            let events = select! {
                recv(control) -> msg => match msg {
                    Ok(command) => {
                        self.machine.apply(command);
                        Vec::new()
                    }
                    Err(_) => {
                        control_closed = true;
                        Vec::new()
                    }
                },
                recv(detections) -> msg => match msg {
                    Ok(batch) => {
                        let _span = tracing::debug_span!(
                            "crossing.observe",
                            detections = batch.detections.len()
                        )
                        .entered();
                        self.horizon.record(batch.captured_at, Instant::now());
                        self.machine.observe(&batch)
                    }
                    Err(_) => {
                        detections_closed = true;
                        Vec::new()
                    }
                },
                recv(ticker) -> _ => match self.horizon.horizon(Instant::now()) {
                    Some(horizon) => self.machine.tick(horizon),
                    None => Vec::new(),
                },
            };
            if control_closed {
                control = never();
            }
            if detections_closed {
                debug!("detection producer disconnected");
                detections = never();
            }

            let requested = self.shed_requests.swap(0, Ordering::Relaxed);
            if requested > 0 {
                let shed = self
                    .machine
                    .shed(requested as usize * SHED_PER_DROPPED_BATCH);
                warn!(
                    dropped_batches = requested,
                    shed, "counting worker behind capture; shedding unconfirmed tracks"
                );
            }

            for event in events {
                self.dispatch.enqueue(event);
            }

            let snapshot = self.machine.snapshot();
            metrics::gauge!("dock_active_tracks").set(snapshot.active_tracks as f64);
            self.snapshot.store(snapshot);
            self.health.beat(HealthComponent::Crossing);
        }
        debug!("crossing worker stopped");
    }
}
