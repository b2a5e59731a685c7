//! Snapshot and control surface for remote controllers and dashboards.
//!
//! Reads are lock-light: every component publishes its own view and the sync
//! layer only copies them. Control commands are never applied here; they are
//! forwarded to the counting worker, which owns the track table.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    crossing::{ControlCommand, CountingSnapshot, CrossingHandle},
    dispatch::{DispatchQueue, SinkHealth},
    error::ControlError,
    frame_buffer::{FrameBuffer, FrameStats},
    pipeline::{
        capture::{CaptureMonitor, CaptureReport},
        telemetry,
        watchdog::{HealthComponent, PipelineHealth, WatchdogState},
    },
};

/// Single-slot publication point: writers swap a fresh `Arc`, readers clone it.
pub struct SnapshotCell<T> {
    inner: Mutex<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Arc::new(value)),
        }
    }

    pub fn store(&self, value: T) {
        let value = Arc::new(value);
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn load(&self) -> Arc<T> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Everything a controller or dashboard can observe.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub counting: CountingSnapshot,
    pub capture: CaptureReport,
    pub frames: FrameStats,
    pub sinks: Vec<SinkHealth>,
    pub stalled: Vec<&'static str>,
    pub dead_letters: u64,
}

/// Remote controller polled by the sync loop (chat bot, control panel, ...).
pub trait ControlSource: Send {
    fn name(&self) -> &str;

    /// Exchange state with the controller: it sees the latest snapshot and
    /// returns any commands it wants applied.
    fn poll(&mut self, snapshot: &Snapshot) -> Result<Vec<ControlCommand>>;
}

#[derive(Debug, Default)]
struct ControllerSession {
    enabled_by_controller: bool,
    last_command: Option<Instant>,
}

pub struct PollingSync {
    frames: Arc<FrameBuffer>,
    crossing: CrossingHandle,
    dispatch: Arc<DispatchQueue>,
    capture: Arc<CaptureMonitor>,
    watchdog: Arc<WatchdogState>,
    latest: SnapshotCell<Option<Snapshot>>,
    session: Mutex<ControllerSession>,
    idle_reset: Option<Duration>,
}

impl PollingSync {
    pub fn new(
        frames: Arc<FrameBuffer>,
        crossing: CrossingHandle,
        dispatch: Arc<DispatchQueue>,
        capture: Arc<CaptureMonitor>,
        watchdog: Arc<WatchdogState>,
        idle_reset: Option<Duration>,
    ) -> Self {
        Self {
            frames,
            crossing,
            dispatch,
            capture,
            watchdog,
            latest: SnapshotCell::new(None),
            session: Mutex::new(ControllerSession::default()),
            idle_reset,
        }
    }

    /// Build a fresh snapshot from every component's published view.
    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            generated_at: Utc::now(),
            counting: (*self.crossing.snapshot()).clone(),
            capture: self.capture.report(),
            frames: self.frames.stats(),
            sinks: self.dispatch.health(),
            stalled: self
                .watchdog
                .stalled()
                .into_iter()
                .map(HealthComponent::label)
                .collect(),
            dead_letters: self.dispatch.dead_letters(),
        }
    }

    /// Last snapshot published by the sync loop, or a fresh one before the first tick.
    pub fn latest(&self) -> Snapshot {
        match self.latest.load().as_ref() {
            Some(snapshot) => snapshot.clone(),
            None => self.get_snapshot(),
        }
    }

    pub fn frames(&self) -> &Arc<FrameBuffer> {
        &self.frames
    }

    pub fn set_counting_enabled(&self, enabled: bool) -> Result<(), ControlError> {
        self.apply(ControlCommand::SetCountingEnabled(enabled))
    }

    pub fn reset_cooldown(&self) -> Result<(), ControlError> {
        self.apply(ControlCommand::ResetCooldown)
    }

    /// Forward a controller command to the counting worker.
    pub fn apply(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.apply_at(command, Instant::now())
    }

    fn apply_at(&self, command: ControlCommand, now: Instant) -> Result<(), ControlError> {
        let enabling = match command {
            ControlCommand::SetCountingEnabled(enabled) => Some(enabled),
            _ => None,
        };
        self.crossing.send_control(command)?;
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.last_command = Some(now);
        if let Some(enabled) = enabling {
            session.enabled_by_controller = enabled;
        }
        Ok(())
    }

    /// One reconciliation round: publish, exchange with controllers and
    /// apply the idle reset.
    pub fn sync_once(&self, sources: &mut [Box<dyn ControlSource>], now: Instant) {
        let snapshot = self.get_snapshot();
        metrics::gauge!("dock_totals", "direction" => "inbound")
            .set(snapshot.counting.totals.inbound as f64);
        metrics::gauge!("dock_totals", "direction" => "outbound")
            .set(snapshot.counting.totals.outbound as f64);

        for source in sources.iter_mut() {
            match source.poll(&snapshot) {
                Ok(commands) => {
                    for command in commands {
                        debug!(source = source.name(), ?command, "controller command");
                        if let Err(err) = self.apply_at(command, now) {
                            warn!(source = source.name(), "control command dropped: {err}");
                        }
                    }
                }
                Err(err) => debug!(source = source.name(), "controller poll failed: {err:#}"),
            }
        }

        self.check_idle_reset(now);
        self.latest.store(Some(snapshot));
    }

    fn check_idle_reset(&self, now: Instant) {
        let Some(idle_reset) = self.idle_reset else {
            return;
        };
        let expired = {
            let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.enabled_by_controller
                && session
                    .last_command
                    .is_some_and(|last| now.saturating_duration_since(last) >= idle_reset)
        };
        if !expired {
            return;
        }
        info!(idle = ?idle_reset, "no controller activity; disabling counting");
        if let Err(err) = self.apply_at(ControlCommand::SetCountingEnabled(false), now) {
            warn!("idle reset could not reach counting worker: {err}");
        }
    }
}

/// Spawn the periodic sync loop.
pub fn spawn_sync_loop(
    sync: Arc<PollingSync>,
    mut sources: Vec<Box<dyn ControlSource>>,
    interval: Duration,
    health: Arc<PipelineHealth>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("dock-sync", move || {
        let interval = interval.max(Duration::from_millis(50));
        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            sync.sync_once(&mut sources, started);
            health.beat(HealthComponent::Sync);
            while started.elapsed() < interval && !shutdown.load(Ordering::Relaxed) {
                thread::sleep(
                    interval
                        .saturating_sub(started.elapsed())
                        .min(Duration::from_millis(100)),
                );
            }
        }
    })
    .context("failed to spawn sync loop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crossing::{CrossingConfig, CrossingStateMachine, spawn_crossing_worker},
        dispatch::{DispatchConfig, testing::RecordingSink},
    };

    struct ScriptedController {
        commands: Vec<Vec<ControlCommand>>,
    }

    impl ControlSource for ScriptedController {
        fn name(&self) -> &str {
            "scripted"
        }

        fn poll(&mut self, _snapshot: &Snapshot) -> Result<Vec<ControlCommand>> {
            Ok(if self.commands.is_empty() {
                Vec::new()
            } else {
                self.commands.remove(0)
            })
        }
    }

    struct Fixture {
        sync: PollingSync,
        crossing: CrossingHandle,
        shutdown: Arc<AtomicBool>,
        joins: Vec<thread::JoinHandle<()>>,
        dispatch: Arc<DispatchQueue>,
    }

    impl Fixture {
        fn new(idle_reset: Option<Duration>) -> Self {
            let shutdown = Arc::new(AtomicBool::new(false));
            let health = Arc::new(PipelineHealth::new());
            let (sink, _) = RecordingSink::new("dashboard");
            let dispatch = Arc::new(
                DispatchQueue::start(
                    DispatchConfig::default(),
                    vec![Box::new(sink)],
                    health.clone(),
                    shutdown.clone(),
                )
                .unwrap(),
            );
            let (crossing, join) = spawn_crossing_worker(
                CrossingStateMachine::new(CrossingConfig::default()),
                4,
                Duration::from_millis(10),
                Duration::from_millis(20),
                dispatch.clone(),
                health,
                shutdown.clone(),
            )
            .unwrap();
            let sync = PollingSync::new(
                Arc::new(FrameBuffer::default()),
                crossing.clone(),
                dispatch.clone(),
                Arc::new(CaptureMonitor::default()),
                Arc::new(WatchdogState::new()),
                idle_reset,
            );
            Self {
                sync,
                crossing,
                shutdown,
                joins: vec![join],
                dispatch,
            }
        }

        fn wait_enabled(&self, expected: bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.crossing.snapshot().enabled == expected {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }

        fn stop(self) {
            self.shutdown.store(true, Ordering::SeqCst);
            for join in self.joins {
                join.join().unwrap();
            }
            self.dispatch.join();
        }
    }

    #[test]
    fn test_snapshot_reports_every_component() {
        let fixture = Fixture::new(None);
        let snapshot = fixture.sync.get_snapshot();
        assert!(snapshot.counting.enabled);
        assert_eq!(snapshot.sinks.len(), 1);
        assert_eq!(snapshot.sinks[0].breaker, "closed");
        assert_eq!(snapshot.frames.frame_count, 0);
        assert!(snapshot.stalled.is_empty());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["capture"]["status"], "stopped");
        fixture.stop();
    }

    #[test]
    fn test_control_goes_through_counting_worker() {
        let fixture = Fixture::new(None);
        fixture.sync.set_counting_enabled(false).unwrap();
        assert!(fixture.wait_enabled(false));
        fixture.sync.reset_cooldown().unwrap();
        fixture.sync.set_counting_enabled(true).unwrap();
        assert!(fixture.wait_enabled(true));
        fixture.stop();
    }

    #[test]
    fn test_controller_commands_and_idle_reset() {
        let fixture = Fixture::new(Some(Duration::from_secs(300)));
        let mut sources: Vec<Box<dyn ControlSource>> = vec![Box::new(ScriptedController {
            commands: vec![
                vec![ControlCommand::SetCountingEnabled(false)],
                vec![ControlCommand::SetCountingEnabled(true)],
            ],
        })];

        let t0 = Instant::now();
        fixture.sync.sync_once(&mut sources, t0);
        assert!(fixture.wait_enabled(false));
        fixture.sync.sync_once(&mut sources, t0 + Duration::from_secs(1));
        assert!(fixture.wait_enabled(true));

        fixture.sync.sync_once(&mut sources, t0 + Duration::from_secs(200));
        assert!(fixture.wait_enabled(true));
        fixture.sync.sync_once(&mut sources, t0 + Duration::from_secs(301));
        assert!(fixture.wait_enabled(false));
        assert!(fixture.sync.latest.load().is_some());
        fixture.stop();
    }
}
