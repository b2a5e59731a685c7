//! Per-sink circuit breaker.
//!
//! The state is a small tagged variant and every change goes through
//! [`transition`] or [`poll`], both pure functions of `(state, input, now)`.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed { failures: u32 },
    /// `opens` counts consecutive opens and drives the backoff.
    Open { until: Instant, opens: u32 },
    HalfOpen { opens: u32 },
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }

    /// Numeric encoding for the `dock_sink_breaker_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed { .. } => 0.0,
            CircuitState::HalfOpen { .. } => 1.0,
            CircuitState::Open { .. } => 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub open_base: Duration,
    pub open_max: Duration,
}

impl BreakerPolicy {
    /// Open duration for the `opens`-th consecutive open: `base * 2^(opens-1)`, capped.
    pub fn open_duration(&self, opens: u32) -> Duration {
        let exponent = opens.saturating_sub(1).min(16);
        self.open_base
            .saturating_mul(1u32 << exponent)
            .min(self.open_max)
    }
}

/// Apply a delivery outcome. Outcomes reported while `Open` are ignored.
pub fn transition(
    state: CircuitState,
    outcome: Outcome,
    now: Instant,
    policy: &BreakerPolicy,
) -> CircuitState {
    match (state, outcome) {
        (CircuitState::Closed { .. }, Outcome::Success)
        | (CircuitState::HalfOpen { .. }, Outcome::Success) => CircuitState::Closed { failures: 0 },
        (CircuitState::Closed { failures }, Outcome::Failure) => {
            let failures = failures + 1;
            if failures >= policy.failure_threshold.max(1) {
                CircuitState::Open {
                    until: now + policy.open_duration(1),
                    opens: 1,
                }
            } else {
                CircuitState::Closed { failures }
            }
        }
        (CircuitState::HalfOpen { opens }, Outcome::Failure) => {
            let opens = opens + 1;
            CircuitState::Open {
                until: now + policy.open_duration(opens),
                opens,
            }
        }
        (open @ CircuitState::Open { .. }, _) => open,
    }
}

/// Move an elapsed `Open` state to `HalfOpen`.
pub fn poll(state: CircuitState, now: Instant) -> CircuitState {
    match state {
        CircuitState::Open { until, opens } if now >= until => CircuitState::HalfOpen { opens },
        other => other,
    }
}

/// Breaker state plus the bookkeeping reported in sink health.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    policy: BreakerPolicy,
    open_since: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            state: CircuitState::Closed { failures: 0 },
            policy,
            open_since: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Start of the current open streak (cleared once the breaker closes).
    pub fn open_since(&self) -> Option<Instant> {
        self.open_since
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.state {
            CircuitState::Closed { failures } => failures,
            CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => {
                self.policy.failure_threshold
            }
        }
    }

    pub fn poll(&mut self, now: Instant) -> CircuitState {
        self.state = poll(self.state, now);
        self.state
    }

    /// Record an outcome, returning the `(previous, next)` states.
    pub fn record(&mut self, outcome: Outcome, now: Instant) -> (CircuitState, CircuitState) {
        let previous = self.state;
        self.state = transition(previous, outcome, now, &self.policy);
        match self.state {
            CircuitState::Open { .. } if self.open_since.is_none() => self.open_since = Some(now),
            CircuitState::Closed { .. } => self.open_since = None,
            _ => {}
        }
        (previous, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 3,
            open_base: Duration::from_secs(5),
            open_max: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let policy = policy();
        let now = Instant::now();
        let mut state = CircuitState::Closed { failures: 0 };
        state = transition(state, Outcome::Failure, now, &policy);
        state = transition(state, Outcome::Failure, now, &policy);
        assert_eq!(state, CircuitState::Closed { failures: 2 });
        state = transition(state, Outcome::Failure, now, &policy);
        assert_eq!(
            state,
            CircuitState::Open {
                until: now + Duration::from_secs(5),
                opens: 1
            }
        );
    }

    #[test]
    fn test_success_resets_failure_count() {
        let policy = policy();
        let now = Instant::now();
        let state = transition(
            CircuitState::Closed { failures: 2 },
            Outcome::Success,
            now,
            &policy,
        );
        assert_eq!(state, CircuitState::Closed { failures: 0 });
    }

    #[test]
    fn test_half_open_failure_backs_off_with_cap() {
        let policy = policy();
        let now = Instant::now();
        let open = CircuitState::Open {
            until: now,
            opens: 1,
        };
        let half = poll(open, now);
        assert_eq!(half, CircuitState::HalfOpen { opens: 1 });
        let reopened = transition(half, Outcome::Failure, now, &policy);
        assert_eq!(
            reopened,
            CircuitState::Open {
                until: now + Duration::from_secs(10),
                opens: 2
            }
        );
        assert_eq!(policy.open_duration(3), Duration::from_secs(20));
        assert_eq!(policy.open_duration(4), Duration::from_secs(30));
        assert_eq!(policy.open_duration(40), Duration::from_secs(30));
    }

    #[test]
    fn test_open_ignores_outcomes_until_elapsed() {
        let policy = policy();
        let now = Instant::now();
        let open = CircuitState::Open {
            until: now + Duration::from_secs(5),
            opens: 1,
        };
        assert_eq!(transition(open, Outcome::Success, now, &policy), open);
        assert_eq!(poll(open, now + Duration::from_secs(4)), open);
        assert_eq!(
            poll(open, now + Duration::from_secs(5)),
            CircuitState::HalfOpen { opens: 1 }
        );
    }

    #[test]
    fn test_breaker_tracks_open_streak() {
        let mut breaker = CircuitBreaker::new(policy());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record(Outcome::Failure, t0);
        }
        assert_eq!(breaker.open_since(), Some(t0));
        let later = t0 + Duration::from_secs(6);
        assert_eq!(breaker.poll(later), CircuitState::HalfOpen { opens: 1 });
        breaker.record(Outcome::Failure, later);
        assert_eq!(breaker.open_since(), Some(t0));

        let recovered = later + Duration::from_secs(11);
        breaker.poll(recovered);
        let (_, next) = breaker.record(Outcome::Success, recovered);
        assert_eq!(next, CircuitState::Closed { failures: 0 });
        assert!(breaker.open_since().is_none());
    }
}
