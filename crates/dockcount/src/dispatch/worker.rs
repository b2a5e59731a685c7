//! Delivery worker: one per sink, sole owner of that sink's breaker.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    dispatch::{
        DeliveryError, Sink,
        breaker::{CircuitBreaker, CircuitState, Outcome},
        journal::{DeadLetterJournal, DeadLetterReason},
        lane::{Lane, QueuedEvent},
    },
    error::Fault,
    model::CountEvent,
    pipeline::watchdog::{HealthComponent, PipelineHealth},
};

/// Longest a worker sleeps before re-checking shutdown.
const MAX_WAIT: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    /// Extra attempts after the first one within a single delivery round.
    pub(crate) attempts: u32,
    pub(crate) base_delay: Duration,
    /// Rounds an event may fail before it is dead-lettered.
    pub(crate) max_rounds: u32,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(8))
    }
}

/// What a single driver step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Idle,
    /// Breaker open until the given instant.
    Waiting(Instant),
    Delivered,
    Failed,
    DeadLettered,
}

pub(crate) struct LaneDriver {
    lane: Arc<Lane>,
    sink: Box<dyn Sink>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    journal: Arc<DeadLetterJournal>,
    alarm_after: Duration,
    head: Option<QueuedEvent>,
    alarmed: bool,
}

impl LaneDriver {
    pub(crate) fn new(
        lane: Arc<Lane>,
        sink: Box<dyn Sink>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        journal: Arc<DeadLetterJournal>,
        alarm_after: Duration,
    ) -> Self {
        Self {
            lane,
            sink,
            breaker,
            retry,
            journal,
            alarm_after,
            head: None,
            alarmed: false,
        }
    }

    pub(crate) fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run one delivery decision at `now`.
    ///
    /// The head event stays with the driver until it is delivered or
    /// dead-lettered so per-sink order is preserved across failures.
    pub(crate) fn step(&mut self, now: Instant) -> Step {
        let before = self.breaker.state();
        let state = self.breaker.poll(now);
        if matches!(before, CircuitState::Open { .. })
            && matches!(state, CircuitState::HalfOpen { .. })
        {
            debug!(sink = self.lane.name(), "breaker half-open; sending trial delivery");
        }

        if self.head.is_none() {
            self.head = self.lane.pop();
        }
        let Some(head) = self.head.clone() else {
            self.publish_status();
            return Step::Idle;
        };

        let result = match state {
            CircuitState::Open { until, .. } => {
                Fault::BreakerOpen.record();
                self.check_alarm(now);
                self.publish_status();
                return Step::Waiting(until);
            }
            CircuitState::HalfOpen { .. } => self.attempt(&head.event, 0),
            CircuitState::Closed { .. } => self.attempt(&head.event, self.retry.attempts),
        };

        let step = match result {
            Ok(()) => {
                self.head = None;
                self.record(Outcome::Success, now);
                metrics::counter!("dock_delivered_total", "sink" => self.lane.name().to_string())
                    .increment(1);
                debug!(sink = self.lane.name(), event_id = head.event.id, "event delivered");
                self.lane.update_status(|status| status.delivered += 1);
                Step::Delivered
            }
            Err(err) => {
                Fault::DeliveryFailure.record();
                self.record(Outcome::Failure, now);
                let rounds = head.failed_rounds + 1;
                let reason = if !err.is_retryable() {
                    Some(DeadLetterReason::Rejected)
                } else if rounds >= self.retry.max_rounds.max(1) {
                    Some(DeadLetterReason::Exhausted)
                } else {
                    None
                };
                let message = err.to_string();
                let step = match reason {
                    Some(reason) => {
                        self.head = None;
                        self.dead_letter(&head.event, reason, Some(&message));
                        Step::DeadLettered
                    }
                    None => {
                        if let Some(head) = self.head.as_mut() {
                            head.failed_rounds = rounds;
                        }
                        Step::Failed
                    }
                };
                self.lane
                    .update_status(|status| status.last_error = Some(message));
                step
            }
        };
        self.publish_status();
        step
    }

    /// Best-effort delivery of whatever is still queued, bounded by `deadline`.
    ///
    /// Failures keep the usual breaker accounting; flushing stops once the
    /// breaker opens. Everything left afterwards is dead-lettered.
    pub(crate) fn flush(&mut self, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.head.is_none() {
                self.head = self.lane.pop();
            }
            let Some(head) = self.head.clone() else {
                break;
            };
            if matches!(self.breaker.poll(now), CircuitState::Open { .. }) {
                break;
            }
            match self.attempt(&head.event, 0) {
                Ok(()) => {
                    self.head = None;
                    self.record(Outcome::Success, now);
                    self.lane.update_status(|status| status.delivered += 1);
                }
                Err(err) => {
                    self.record(Outcome::Failure, now);
                    let rounds = head.failed_rounds + 1;
                    let message = err.to_string();
                    if !err.is_retryable() {
                        self.head = None;
                        self.dead_letter(
                            &head.event,
                            DeadLetterReason::Rejected,
                            Some(&message),
                        );
                    } else if rounds >= self.retry.max_rounds.max(1) {
                        self.head = None;
                        self.dead_letter(
                            &head.event,
                            DeadLetterReason::Exhausted,
                            Some(&message),
                        );
                    } else {
                        if let Some(head) = self.head.as_mut() {
                            head.failed_rounds = rounds;
                        }
                        // Keep going until the breaker opens or grace runs out.
                        let pause = self
                            .retry
                            .base_delay
                            .min(deadline.saturating_duration_since(Instant::now()));
                        thread::sleep(pause);
                    }
                    self.lane
                        .update_status(|status| status.last_error = Some(message));
                }
            }
        }

        let mut remaining = 0usize;
        while let Some(queued) = self.head.take().or_else(|| self.lane.pop()) {
            remaining += 1;
            self.dead_letter(&queued.event, DeadLetterReason::Shutdown, None);
        }
        if remaining > 0 {
            warn!(
                sink = self.lane.name(),
                remaining, "shutdown grace period ended with undelivered events"
            );
        }
        self.publish_status();
    }

    pub(crate) fn dead_letter(
        &self,
        event: &CountEvent,
        reason: DeadLetterReason,
        detail: Option<&str>,
    ) {
        self.journal.record(self.lane.name(), reason, detail, event);
        self.lane.update_status(|status| status.dead_lettered += 1);
    }

    fn attempt(&mut self, event: &CountEvent, retries: u32) -> Result<(), DeliveryError> {
        let _span = tracing::debug_span!(
            "dispatch.deliver",
            sink = self.lane.name(),
            event_id = event.id
        )
        .entered();
        let mut attempt = 0;
        loop {
            match self.sink.deliver(event) {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() || attempt >= retries => return Err(err),
                Err(err) => {
                    debug!(
                        sink = self.lane.name(),
                        attempt,
                        "delivery attempt failed: {err}"
                    );
                    thread::sleep(self.retry.delay(attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn record(&mut self, outcome: Outcome, now: Instant) {
        let (previous, next) = self.breaker.record(outcome, now);
        match (previous, next) {
            (
                CircuitState::Open { .. } | CircuitState::HalfOpen { .. },
                CircuitState::Closed { .. },
            ) => {
                info!(
                    sink = self.lane.name(),
                    backlog = self.lane.len(),
                    "breaker closed; draining backlog"
                );
                self.alarmed = false;
            }
            (_, CircuitState::Open { until, opens })
                if !matches!(previous, CircuitState::Open { .. }) =>
            {
                debug!(
                    sink = self.lane.name(),
                    opens,
                    open_for = ?until.saturating_duration_since(now),
                    "breaker opened"
                );
            }
            _ => {}
        }
    }

    fn check_alarm(&mut self, now: Instant) {
        if self.alarmed {
            return;
        }
        if let Some(since) = self.breaker.open_since() {
            let open_for = now.saturating_duration_since(since);
            if open_for >= self.alarm_after {
                self.alarmed = true;
                warn!(
                    sink = self.lane.name(),
                    open_for = ?open_for,
                    backlog = self.lane.len(),
                    "sink breaker has been open beyond alarm threshold"
                );
            }
        }
    }

    fn publish_status(&self) {
        let state = self.breaker.state();
        let failures = self.breaker.consecutive_failures();
        let open_since = self.breaker.open_since().map(|since| {
            let ago = Instant::now().saturating_duration_since(since);
            Utc::now() - chrono::TimeDelta::from_std(ago).unwrap_or_default()
        });
        let in_flight = self.head.is_some();
        self.lane.update_status(|status| {
            status.breaker = state.label();
            status.consecutive_failures = failures;
            status.in_flight = in_flight;
            status.open_since = open_since;
        });
        let name = self.lane.name().to_string();
        metrics::gauge!("dock_sink_breaker_state", "sink" => name.clone()).set(state.gauge_value());
        metrics::gauge!("dock_sink_queue_depth", "sink" => name)
            .set((self.lane.len() + usize::from(in_flight)) as f64);
    }
}

/// Drive a lane until shutdown, then flush within `grace`.
pub(crate) fn run_lane(
    mut driver: LaneDriver,
    health: Arc<PipelineHealth>,
    shutdown: Arc<AtomicBool>,
    grace: Duration,
) {
    let lane = driver.lane.clone();
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        match driver.step(now) {
            Step::Idle => lane.wait(MAX_WAIT),
            Step::Waiting(until) => lane.wait(until.saturating_duration_since(now).min(MAX_WAIT)),
            Step::Failed => thread::sleep(driver.retry.base_delay.min(MAX_WAIT)),
            Step::Delivered | Step::DeadLettered => {}
        }
        health.beat(HealthComponent::Dispatch);
    }
    debug!(sink = lane.name(), "flushing lane before shutdown");
    driver.flush(Instant::now() + grace);
}
