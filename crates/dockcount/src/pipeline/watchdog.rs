//! Watchdog detecting stalled pipeline stages.
//!
//! Capture, counting, delivery and sync threads emit heartbeats. A stage that
//! stops beating is reported as stalled in snapshots; a stalled capture stage
//! additionally gets its source reopened once it comes back.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::pipeline::telemetry;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 15_000;
/// Grace period at startup allowing components to warm up before monitoring.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 10_000;

const UNMONITORED: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Logical components monitored by the watchdog.
pub enum HealthComponent {
    Capture,
    Crossing,
    Dispatch,
    Sync,
}

impl HealthComponent {
    pub const ALL: [HealthComponent; 4] = [
        HealthComponent::Capture,
        HealthComponent::Crossing,
        HealthComponent::Dispatch,
        HealthComponent::Sync,
    ];

    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Crossing => "crossing",
            HealthComponent::Dispatch => "dispatch",
            HealthComponent::Sync => "sync",
        }
    }

    fn index(self) -> usize {
        match self {
            HealthComponent::Capture => 0,
            HealthComponent::Crossing => 1,
            HealthComponent::Dispatch => 2,
            HealthComponent::Sync => 3,
        }
    }
}

pub struct PipelineHealth {
    beats: [AtomicU64; 4],
}

impl PipelineHealth {
    /// Initialise the health tracker with grace periods for each component.
    pub fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            beats: std::array::from_fn(|_| AtomicU64::new(grace_deadline)),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub fn beat(&self, component: HealthComponent) {
        self.beats[component.index()].store(current_millis(), Ordering::Relaxed);
    }

    /// Stop monitoring a component that is not running in this deployment.
    pub fn ignore(&self, component: HealthComponent) {
        self.beats[component.index()].store(UNMONITORED, Ordering::Relaxed);
    }

    /// Components that have not produced a heartbeat within `threshold_ms`.
    pub(crate) fn stale_components(&self, now: u64, threshold_ms: u64) -> Vec<HealthComponent> {
        HealthComponent::ALL
            .into_iter()
            .filter(|component| {
                let last = self.beats[component.index()].load(Ordering::Relaxed);
                last != UNMONITORED && now.saturating_sub(last) > threshold_ms
            })
            .collect()
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog findings shared with the snapshot layer and the capture loop.
pub struct WatchdogState {
    stalled: Mutex<Vec<HealthComponent>>,
    capture_restart: AtomicBool,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self {
            stalled: Mutex::new(Vec::new()),
            capture_restart: AtomicBool::new(false),
        }
    }

    pub fn stalled(&self) -> Vec<HealthComponent> {
        self.stalled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns whether a capture restart was requested, clearing the request.
    pub fn take_capture_restart(&self) -> bool {
        self.capture_restart.swap(false, Ordering::SeqCst)
    }

    /// Replace the stalled set, logging transitions.
    pub(crate) fn update(&self, stale: Vec<HealthComponent>) {
        let mut stalled = self.stalled.lock().unwrap_or_else(PoisonError::into_inner);
        for component in &stale {
            if !stalled.contains(component) {
                error!(component = component.label(), "watchdog detected stalled stage");
                metrics::counter!("dock_watchdog_stalls_total", "component" => component.label())
                    .increment(1);
                if *component == HealthComponent::Capture {
                    self.capture_restart.store(true, Ordering::SeqCst);
                }
            }
        }
        for component in stalled.iter() {
            if !stale.contains(component) {
                info!(component = component.label(), "stage recovered");
            }
        }
        *stalled = stale;
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the watchdog thread polling component health until shutdown.
pub fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    state: Arc<WatchdogState>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("dock-watchdog", move || {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let stale = health.stale_components(current_millis(), WATCHDOG_STALE_THRESHOLD_MS);
            state.update(stale);
        }
    })
    .context("failed to spawn watchdog thread")
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
