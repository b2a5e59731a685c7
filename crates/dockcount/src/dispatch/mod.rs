//! Resilient delivery of confirmed events to external sinks.
//!
//! Each sink gets its own bounded lane and worker thread. The producer only
//! ever appends to lanes; the worker owns the sink's circuit breaker, retries
//! and dead-lettering. A slow or dead sink never blocks counting or other sinks.

pub mod breaker;
pub mod journal;
mod lane;
mod worker;

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::AtomicBool,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    dispatch::{
        breaker::{BreakerPolicy, CircuitBreaker},
        journal::{DeadLetterJournal, DeadLetterReason},
        lane::Lane,
        worker::{LaneDriver, RetryPolicy, run_lane},
    },
    error::Fault,
    model::CountEvent,
    pipeline::{telemetry, watchdog::PipelineHealth},
};

/// External system receiving confirmed events.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Deliver one event. `Ok` is an acknowledgement from the sink.
    fn deliver(&mut self, event: &CountEvent) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The sink answered and refused the event; retrying will not help.
    #[error("sink rejected event: {0}")]
    Rejected(String),
    #[error("delivery timed out")]
    Timeout,
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Rejected(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Events buffered per sink before the oldest is dead-lettered.
    pub queue_capacity: usize,
    /// Extra attempts per delivery round.
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Consecutive failed rounds that open the breaker.
    pub failure_threshold: u32,
    pub open_secs: f64,
    pub open_max_secs: f64,
    /// Failed rounds after which an event is dead-lettered.
    pub max_rounds: u32,
    pub shutdown_grace_secs: f64,
    /// Open breakers are only escalated to a warning after this long.
    pub breaker_alarm_secs: f64,
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            retry_attempts: 2,
            retry_delay_ms: 250,
            failure_threshold: 3,
            open_secs: 5.0,
            open_max_secs: 300.0,
            max_rounds: 5,
            shutdown_grace_secs: 5.0,
            breaker_alarm_secs: 60.0,
            dead_letter_path: None,
        }
    }
}

impl DispatchConfig {
    pub(crate) fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold,
            open_base: secs(self.open_secs),
            open_max: secs(self.open_max_secs),
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_rounds: self.max_rounds,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// Per-sink health as exposed through snapshots.
#[derive(Clone, Debug, Serialize)]
pub struct SinkHealth {
    pub name: String,
    pub breaker: &'static str,
    pub consecutive_failures: u32,
    pub queue_depth: usize,
    pub last_error: Option<String>,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub open_since: Option<DateTime<Utc>>,
}

pub struct DispatchQueue {
    lanes: Vec<Arc<Lane>>,
    journal: Arc<DeadLetterJournal>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Create one lane and worker thread per sink.
    pub fn start(
        config: DispatchConfig,
        sinks: Vec<Box<dyn Sink>>,
        health: Arc<PipelineHealth>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let journal = Arc::new(DeadLetterJournal::open(config.dead_letter_path.as_deref())?);
        let grace = secs(config.shutdown_grace_secs);
        let mut lanes = Vec::with_capacity(sinks.len());
        let mut workers = Vec::with_capacity(sinks.len());

        for sink in sinks {
            let lane = Arc::new(Lane::new(sink.name(), config.queue_capacity));
            let driver = LaneDriver::new(
                lane.clone(),
                sink,
                CircuitBreaker::new(config.breaker_policy()),
                config.retry_policy(),
                journal.clone(),
                secs(config.breaker_alarm_secs),
            );
            let health = health.clone();
            let shutdown = shutdown.clone();
            let handle = telemetry::spawn_thread(format!("dock-sink-{}", lane.name()), move || {
                run_lane(driver, health, shutdown, grace)
            })
            .with_context(|| format!("failed to spawn delivery worker for {}", lane.name()))?;
            info!(sink = lane.name(), capacity = config.queue_capacity, "delivery lane started");
            lanes.push(lane);
            workers.push(handle);
        }

        Ok(Self {
            lanes,
            journal,
            workers: Mutex::new(workers),
        })
    }

    /// Append an event to every sink lane. Never blocks on sink I/O.
    pub fn enqueue(&self, event: CountEvent) {
        let event = Arc::new(event);
        for lane in &self.lanes {
            if let Some(evicted) = lane.push(event.clone()) {
                Fault::QueueOverflow.record();
                self.journal.record(
                    lane.name(),
                    DeadLetterReason::Overflow,
                    Some("lane buffer full"),
                    &evicted.event,
                );
                lane.update_status(|status| status.dead_lettered += 1);
            }
        }
    }

    pub fn health(&self) -> Vec<SinkHealth> {
        self.lanes
            .iter()
            .map(|lane| {
                let (status, depth) = lane.status();
                SinkHealth {
                    name: lane.name().to_string(),
                    breaker: status.breaker,
                    consecutive_failures: status.consecutive_failures,
                    queue_depth: depth + usize::from(status.in_flight),
                    last_error: status.last_error,
                    delivered: status.delivered,
                    dead_lettered: status.dead_lettered,
                    open_since: status.open_since,
                }
            })
            .collect()
    }

    pub fn dead_letters(&self) -> u64 {
        self.journal.recorded()
    }

    /// Wait for every worker to finish its shutdown flush.
    pub fn join(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::Ordering,
        time::Instant,
    };

    use super::{
        breaker::CircuitState,
        testing::{FlakySink, RecordingSink},
        worker::Step,
        *,
    };
    use crate::model::{Direction, EventMetadata, ObjectClass, TrackId};

    fn event(id: u64) -> CountEvent {
        CountEvent {
            id,
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            track_id: TrackId(id),
            class: ObjectClass::Truck,
            metadata: EventMetadata::default(),
        }
    }

    fn test_config(capacity: usize) -> DispatchConfig {
        DispatchConfig {
            queue_capacity: capacity,
            retry_attempts: 0,
            retry_delay_ms: 0,
            failure_threshold: 3,
            open_secs: 5.0,
            open_max_secs: 60.0,
            max_rounds: 100,
            ..DispatchConfig::default()
        }
    }

    fn driver(
        config: &DispatchConfig,
        sink: impl Sink + 'static,
    ) -> (LaneDriver, Arc<Lane>, Arc<DeadLetterJournal>) {
        let lane = Arc::new(Lane::new("flaky", config.queue_capacity));
        let journal = Arc::new(DeadLetterJournal::disabled());
        let driver = LaneDriver::new(
            lane.clone(),
            Box::new(sink),
            CircuitBreaker::new(config.breaker_policy()),
            config.retry_policy(),
            journal.clone(),
            Duration::from_secs(60),
        );
        (driver, lane, journal)
    }

    fn push(lane: &Lane, journal: &DeadLetterJournal, id: u64) {
        if let Some(evicted) = lane.push(Arc::new(event(id))) {
            journal.record(lane.name(), DeadLetterReason::Overflow, None, &evicted.event);
        }
    }

    #[test]
    fn test_breaker_opens_after_threshold_and_half_open_sends_one_trial() {
        let config = test_config(8);
        let sink = FlakySink::new(true);
        let calls = sink.calls.clone();
        let (mut driver, lane, journal) = driver(&config, sink);
        push(&lane, &journal, 1);

        let t0 = Instant::now();
        assert_eq!(driver.step(t0), Step::Failed);
        assert_eq!(driver.step(t0), Step::Failed);
        assert_eq!(driver.step(t0), Step::Failed);
        assert!(matches!(driver.breaker_state(), CircuitState::Open { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(matches!(
            driver.step(t0 + Duration::from_secs(1)),
            Step::Waiting(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let reopened_at = t0 + Duration::from_secs(5);
        assert_eq!(driver.step(reopened_at), Step::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            driver.breaker_state(),
            CircuitState::Open {
                until: reopened_at + Duration::from_secs(10),
                opens: 2
            }
        );
    }

    #[test]
    fn test_overflow_while_open_dead_letters_oldest() {
        let capacity = 3;
        let config = test_config(capacity);
        let sink = FlakySink::new(true);
        let (mut driver, lane, journal) = driver(&config, sink);

        push(&lane, &journal, 1);
        let t0 = Instant::now();
        for _ in 0..3 {
            driver.step(t0);
        }
        assert!(matches!(driver.breaker_state(), CircuitState::Open { .. }));

        for id in 2..2 + capacity as u64 {
            push(&lane, &journal, id);
        }
        assert_eq!(journal.recorded(), 0);
        push(&lane, &journal, 99);
        assert_eq!(journal.recorded(), 1);
        assert_eq!(lane.pop().map(|queued| queued.event.id), Some(3));
    }

    #[test]
    fn test_recovery_drains_backlog_in_order() {
        let config = test_config(16);
        let sink = FlakySink::new(true);
        let failing = sink.failing.clone();
        let delivered = sink.delivered.clone();
        let (mut driver, lane, journal) = driver(&config, sink);

        for id in 1..=5 {
            push(&lane, &journal, id);
        }
        let t0 = Instant::now();
        for _ in 0..3 {
            driver.step(t0);
        }
        failing.store(false, Ordering::SeqCst);

        let later = t0 + Duration::from_secs(5);
        assert_eq!(driver.step(later), Step::Delivered);
        assert_eq!(driver.breaker_state(), CircuitState::Closed { failures: 0 });
        while driver.step(later) == Step::Delivered {}
        assert_eq!(*delivered.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rejected_events_are_dead_lettered_immediately() {
        struct RejectingSink;
        impl Sink for RejectingSink {
            fn name(&self) -> &str {
                "rejecting"
            }
            fn deliver(&mut self, _event: &CountEvent) -> Result<(), DeliveryError> {
                Err(DeliveryError::Rejected("400 bad payload".into()))
            }
        }

        let config = test_config(4);
        let lane = Arc::new(Lane::new("rejecting", 4));
        let journal = Arc::new(DeadLetterJournal::disabled());
        let mut driver = LaneDriver::new(
            lane.clone(),
            Box::new(RejectingSink),
            CircuitBreaker::new(config.breaker_policy()),
            config.retry_policy(),
            journal.clone(),
            Duration::from_secs(60),
        );
        lane.push(Arc::new(event(1)));
        assert_eq!(driver.step(Instant::now()), Step::DeadLettered);
        assert_eq!(journal.recorded(), 1);
        let (status, depth) = lane.status();
        assert_eq!(depth, 0);
        assert_eq!(status.dead_lettered, 1);
        assert!(status.last_error.unwrap().contains("400"));
    }

    #[test]
    fn test_exhausted_rounds_dead_letter_head() {
        let mut config = test_config(4);
        config.max_rounds = 2;
        config.failure_threshold = 10;
        let (mut driver, lane, journal) = driver(&config, FlakySink::new(true));
        push(&lane, &journal, 1);
        push(&lane, &journal, 2);
        let now = Instant::now();
        assert_eq!(driver.step(now), Step::Failed);
        assert_eq!(driver.step(now), Step::DeadLettered);
        assert_eq!(journal.recorded(), 1);
        assert_eq!(lane.len(), 1);
    }

    #[test]
    fn test_flush_dead_letters_when_breaker_open() {
        let config = test_config(8);
        let (mut driver, lane, journal) = driver(&config, FlakySink::new(true));
        for id in 1..=3 {
            push(&lane, &journal, id);
        }
        let now = Instant::now();
        for _ in 0..3 {
            driver.step(now);
        }
        driver.flush(Instant::now() + Duration::from_millis(200));
        assert_eq!(journal.recorded(), 3);
        assert_eq!(lane.len(), 0);
    }

    #[test]
    fn test_flush_retries_transient_failure_while_breaker_closed() {
        struct FailsOnce {
            failed: bool,
            delivered: Arc<Mutex<Vec<u64>>>,
        }
        impl Sink for FailsOnce {
            fn name(&self) -> &str {
                "fails-once"
            }
            fn deliver(&mut self, event: &CountEvent) -> Result<(), DeliveryError> {
                if !self.failed {
                    self.failed = true;
                    return Err(DeliveryError::Timeout);
                }
                self.delivered.lock().unwrap().push(event.id);
                Ok(())
            }
        }

        let config = test_config(8);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = FailsOnce {
            failed: false,
            delivered: delivered.clone(),
        };
        let (mut driver, lane, journal) = driver(&config, sink);
        for id in 1..=3 {
            push(&lane, &journal, id);
        }
        driver.flush(Instant::now() + Duration::from_secs(2));
        assert_eq!(*delivered.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(journal.recorded(), 0);
        assert_eq!(driver.breaker_state(), CircuitState::Closed { failures: 0 });
    }

    #[test]
    fn test_queue_delivers_in_order_to_every_sink_and_flushes_on_shutdown() {
        let (first, first_seen) = RecordingSink::new("sheets");
        let (second, second_seen) = RecordingSink::new("chat");
        let shutdown = Arc::new(AtomicBool::new(false));
        let queue = DispatchQueue::start(
            DispatchConfig::default(),
            vec![Box::new(first), Box::new(second)],
            Arc::new(PipelineHealth::new()),
            shutdown.clone(),
        )
        .unwrap();

        for id in 1..=20 {
            queue.enqueue(event(id));
        }
        shutdown.store(true, Ordering::SeqCst);
        queue.join();

        let expected: Vec<u64> = (1..=20).collect();
        let ids = |seen: &Arc<Mutex<Vec<CountEvent>>>| -> Vec<u64> {
            seen.lock().unwrap().iter().map(|e| e.id).collect()
        };
        assert_eq!(ids(&first_seen), expected);
        assert_eq!(ids(&second_seen), expected);
        assert_eq!(queue.dead_letters(), 0);
        let health = queue.health();
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(|sink| sink.delivered == 20 && sink.queue_depth == 0));
    }
}
