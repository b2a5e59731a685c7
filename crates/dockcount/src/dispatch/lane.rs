//! Bounded per-sink queue shared by the producer and that sink's worker.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::model::CountEvent;

#[derive(Clone, Debug)]
pub(crate) struct QueuedEvent {
    pub(crate) event: Arc<CountEvent>,
    pub(crate) failed_rounds: u32,
}

/// Status fields published by the worker for health snapshots.
#[derive(Clone, Debug, Default)]
pub(crate) struct LaneStatus {
    pub(crate) breaker: &'static str,
    pub(crate) consecutive_failures: u32,
    pub(crate) in_flight: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) delivered: u64,
    pub(crate) dead_lettered: u64,
    pub(crate) open_since: Option<DateTime<Utc>>,
}

struct LaneInner {
    queue: VecDeque<QueuedEvent>,
    status: LaneStatus,
}

pub(crate) struct Lane {
    name: String,
    capacity: usize,
    inner: Mutex<LaneInner>,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl Lane {
    pub(crate) fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(LaneInner {
                queue: VecDeque::with_capacity(capacity.max(1)),
                status: LaneStatus {
                    breaker: "closed",
                    ..LaneStatus::default()
                },
            }),
            doorbell_tx,
            doorbell_rx,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Append an event. When the buffer is full the oldest buffered event is
    /// evicted and returned for dead-lettering.
    pub(crate) fn push(&self, event: Arc<CountEvent>) -> Option<QueuedEvent> {
        let evicted = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if inner.queue.len() >= self.capacity {
                inner.queue.pop_front()
            } else {
                None
            };
            inner.queue.push_back(QueuedEvent {
                event,
                failed_rounds: 0,
            });
            evicted
        };
        let _ = self.doorbell_tx.try_send(());
        evicted
    }

    pub(crate) fn pop(&self) -> Option<QueuedEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    /// Block until an event is pushed or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) {
        let _ = self.doorbell_rx.recv_timeout(timeout);
    }

    pub(crate) fn update_status(&self, update: impl FnOnce(&mut LaneStatus)) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut inner.status);
    }

    /// Copy of the status and current buffered depth.
    pub(crate) fn status(&self) -> (LaneStatus, usize) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        (inner.status.clone(), inner.queue.len())
    }
}
