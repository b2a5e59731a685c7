//! Fault taxonomy and the few errors that cross component boundaries.

use thiserror::Error;

/// Faults handled inside their owning component.
///
/// None of these unwind past the component that observes them; they are logged
/// and counted under `dock_faults_total{kind}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Video source unreachable or a read failed.
    CaptureFailure,
    /// Detection without a resolvable track id.
    AssociationGap,
    /// Persistence timer fired for a track that was evicted or re-armed.
    TimerRace,
    /// Sink rejected the event or the attempt timed out.
    DeliveryFailure,
    /// Delivery skipped because the sink's breaker is open.
    BreakerOpen,
    /// Bounded buffer full, oldest entry dead-lettered.
    QueueOverflow,
}

impl Fault {
    pub fn label(self) -> &'static str {
        match self {
            Fault::CaptureFailure => "capture_failure",
            Fault::AssociationGap => "association_gap",
            Fault::TimerRace => "timer_race",
            Fault::DeliveryFailure => "delivery_failure",
            Fault::BreakerOpen => "breaker_open",
            Fault::QueueOverflow => "queue_overflow",
        }
    }

    pub fn record(self) {
        self.record_n(1);
    }

    pub fn record_n(self, count: u64) {
        if count > 0 {
            metrics::counter!("dock_faults_total", "kind" => self.label()).increment(count);
        }
    }
}

/// Failure to hand a control command to the counting worker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("counting worker is busy; control command dropped")]
    Busy,
    #[error("counting worker has stopped")]
    Stopped,
}
