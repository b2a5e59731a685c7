//! Persistence/cooldown state machine turning per-frame observations into
//! confirmed directional crossings.
//!
//! Track lifecycle: `Unconfirmed → PendingDirection → Confirmed → Cooldown →
//! evicted`. Confirmation is the instant the event is emitted; the track then
//! sits in `Cooldown` with `confirmed` set until the window expires and it is
//! evicted. Persistence deadlines live in a min-heap so `tick` only touches
//! tracks whose timer is due.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    crossing::line::CountingLine,
    error::Fault,
    model::{CountEvent, Detection, Direction, EventMetadata, ObjectClass, Side, TrackId},
};

/// Maps a side pair onto a direction. Camera orientation differs per dock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionMap {
    pub above_to_below: Direction,
    pub below_to_above: Direction,
}

impl Default for DirectionMap {
    fn default() -> Self {
        Self {
            above_to_below: Direction::Inbound,
            below_to_above: Direction::Outbound,
        }
    }
}

impl DirectionMap {
    pub fn inverted(self) -> Self {
        Self {
            above_to_below: self.below_to_above,
            below_to_above: self.above_to_below,
        }
    }

    pub fn resolve(&self, from: Side, to: Side) -> Option<Direction> {
        match (from, to) {
            (Side::Above, Side::Below) => Some(self.above_to_below),
            (Side::Below, Side::Above) => Some(self.below_to_above),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossingConfig {
    /// Time a track must stay on its new side before the crossing counts.
    pub persistence_secs: f64,
    /// Window after confirmation during which the track cannot count again.
    pub cooldown_secs: f64,
    /// Tracks without a detection for this long are evicted.
    pub silence_secs: f64,
    pub directions: DirectionMap,
    pub line: CountingLine,
    pub counted_classes: Vec<ObjectClass>,
    pub min_confidence: f32,
    pub max_tracks: usize,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            persistence_secs: 3.0,
            cooldown_secs: 5.0,
            silence_secs: 10.0,
            directions: DirectionMap::default(),
            line: CountingLine::default(),
            counted_classes: ObjectClass::ALL.to_vec(),
            min_confidence: 0.35,
            max_tracks: 256,
        }
    }
}

impl CrossingConfig {
    pub fn persistence(&self) -> Duration {
        secs(self.persistence_secs)
    }

    pub fn cooldown(&self) -> Duration {
        secs(self.cooldown_secs)
    }

    pub fn silence(&self) -> Duration {
        secs(self.silence_secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// A detection already resolved to a track by the association stage.
#[derive(Clone, Debug)]
pub struct TrackedDetection {
    pub track_id: TrackId,
    pub detection: Detection,
}

/// All tracked detections from one frame.
#[derive(Clone, Debug)]
pub struct DetectionBatch {
    pub frame_size: (u32, u32),
    pub captured_at: Instant,
    pub detections: Vec<TrackedDetection>,
}

/// Commands from controllers. Applied on the counting worker only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum ControlCommand {
    SetCountingEnabled(bool),
    ResetCooldown,
    ResetTotals,
    SetPlate(Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackPhase {
    Unconfirmed,
    PendingDirection {
        from: Side,
        to: Side,
        since: Instant,
    },
    Cooldown {
        until: Instant,
    },
}

impl TrackPhase {
    pub fn label(&self) -> &'static str {
        match self {
            TrackPhase::Unconfirmed => "unconfirmed",
            TrackPhase::PendingDirection { .. } => "pending_direction",
            TrackPhase::Cooldown { .. } => "cooldown",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub class: ObjectClass,
    pub last_seen: Instant,
    pub side: Side,
    pub phase: TrackPhase,
    pub confirmed: bool,
    generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PendingTimer {
    deadline: Instant,
    track: TrackId,
    generation: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountTotals {
    pub inbound: u64,
    pub outbound: u64,
    pub by_class: BTreeMap<ObjectClass, u64>,
}

/// Read-only view published by the counting worker.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CountingSnapshot {
    pub enabled: bool,
    pub totals: CountTotals,
    pub active_tracks: usize,
    pub pending_tracks: usize,
    pub cooldown_tracks: usize,
    pub plate: Option<String>,
    pub last_event: Option<CountEvent>,
    pub shed_tracks: u64,
}

pub struct CrossingStateMachine {
    config: CrossingConfig,
    tracks: HashMap<TrackId, Track>,
    timers: BinaryHeap<Reverse<PendingTimer>>,
    enabled: bool,
    next_event_id: u64,
    next_generation: u64,
    totals: CountTotals,
    plate: Option<String>,
    last_event: Option<CountEvent>,
    shed_tracks: u64,
    epoch: (Instant, DateTime<Utc>),
}

impl CrossingStateMachine {
    pub fn new(config: CrossingConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            timers: BinaryHeap::new(),
            enabled: true,
            next_event_id: 1,
            next_generation: 0,
            totals: CountTotals::default(),
            plate: None,
            last_event: None,
            shed_tracks: 0,
            epoch: (Instant::now(), Utc::now()),
        }
    }

    #[cfg(test)]
    pub(crate) fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Resolve due timers, then apply every observation in the batch.
    pub fn observe(&mut self, batch: &DetectionBatch) -> Vec<CountEvent> {
        let now = batch.captured_at;
        let events = self.tick(now);
        if !self.enabled {
            return events;
        }

        for tracked in &batch.detections {
            let detection = &tracked.detection;
            if detection.confidence < self.config.min_confidence
                || !self.config.counted_classes.contains(&detection.class)
            {
                continue;
            }
            let side = self.config.line.classify(detection.bbox, batch.frame_size);
            self.apply_observation(tracked.track_id, detection.class, side, now);
        }
        events
    }

    /// Resolve persistence timers due at `now` and sweep silent or expired tracks.
    ///
    /// Confirmations are returned in deadline order.
    pub fn tick(&mut self, now: Instant) -> Vec<CountEvent> {
        let mut events = Vec::new();
        let cooldown = self.config.cooldown();
        let silence = self.config.silence();

        while let Some(Reverse(timer)) = self.timers.peek().copied() {
            if timer.deadline > now {
                break;
            }
            self.timers.pop();

            let Some(track) = self.tracks.get_mut(&timer.track) else {
                Fault::TimerRace.record();
                continue;
            };
            let TrackPhase::PendingDirection { from, to, .. } = track.phase else {
                Fault::TimerRace.record();
                continue;
            };
            if track.generation != timer.generation {
                Fault::TimerRace.record();
                continue;
            }

            if track.last_seen + silence <= timer.deadline {
                debug!(track = %timer.track, "track went silent before crossing was confirmed");
                self.tracks.remove(&timer.track);
                continue;
            }

            let Some(direction) = self.config.directions.resolve(from, to) else {
                track.phase = TrackPhase::Unconfirmed;
                continue;
            };
            track.confirmed = true;
            track.phase = TrackPhase::Cooldown {
                until: timer.deadline + cooldown,
            };
            let class = track.class;
            events.push(self.emit(timer.track, class, direction, timer.deadline));
        }

        self.sweep(now);
        events
    }

    pub fn apply(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetCountingEnabled(enabled) => {
                if !enabled {
                    self.tracks.clear();
                    self.timers.clear();
                }
                if self.enabled != enabled {
                    info!(enabled, "counting toggled");
                }
                self.enabled = enabled;
            }
            ControlCommand::ResetCooldown => {
                let before = self.tracks.len();
                self.tracks
                    .retain(|_, track| !matches!(track.phase, TrackPhase::Cooldown { .. }));
                info!(released = before - self.tracks.len(), "cooldowns reset");
            }
            ControlCommand::ResetTotals => {
                self.totals = CountTotals::default();
                self.last_event = None;
                info!("totals reset");
            }
            ControlCommand::SetPlate(plate) => {
                let plate = plate
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty());
                info!(plate = ?plate, "plate updated");
                self.plate = plate;
            }
        }
    }

    /// Evict up to `count` least-recently-seen unconfirmed tracks.
    pub fn shed(&mut self, count: usize) -> usize {
        let mut candidates: Vec<(Instant, TrackId)> = self
            .tracks
            .values()
            .filter(|track| track.phase == TrackPhase::Unconfirmed)
            .map(|track| (track.last_seen, track.id))
            .collect();
        candidates.sort();
        let shed = candidates.len().min(count);
        for (_, id) in candidates.into_iter().take(shed) {
            self.tracks.remove(&id);
        }
        self.shed_tracks += shed as u64;
        shed
    }

    pub fn snapshot(&self) -> CountingSnapshot {
        let mut snapshot = CountingSnapshot {
            enabled: self.enabled,
            totals: self.totals.clone(),
            active_tracks: self.tracks.len(),
            plate: self.plate.clone(),
            last_event: self.last_event.clone(),
            shed_tracks: self.shed_tracks,
            ..CountingSnapshot::default()
        };
        for track in self.tracks.values() {
            match track.phase {
                TrackPhase::PendingDirection { .. } => snapshot.pending_tracks += 1,
                TrackPhase::Cooldown { .. } => snapshot.cooldown_tracks += 1,
                TrackPhase::Unconfirmed => {}
            }
        }
        snapshot
    }

    fn apply_observation(&mut self, id: TrackId, class: ObjectClass, side: Side, now: Instant) {
        if !self.tracks.contains_key(&id) {
            if self.tracks.len() >= self.config.max_tracks && self.shed(1) == 0 {
                debug!(track = %id, "track table full; observation dropped");
                return;
            }
            self.tracks.insert(
                id,
                Track {
                    id,
                    class,
                    last_seen: now,
                    side,
                    phase: TrackPhase::Unconfirmed,
                    confirmed: false,
                    generation: 0,
                },
            );
            return;
        }

        let persistence = self.config.persistence();
        let mut arm = None;
        let Some(track) = self.tracks.get_mut(&id) else {
            return;
        };
        // Batches can arrive out of capture order; never rewind.
        track.last_seen = track.last_seen.max(now);
        if side == Side::Unknown {
            return;
        }

        match track.phase {
            TrackPhase::Cooldown { .. } => {}
            TrackPhase::Unconfirmed => {
                if track.side == Side::Unknown {
                    track.side = side;
                } else if track.side != side {
                    self.next_generation += 1;
                    track.generation = self.next_generation;
                    track.phase = TrackPhase::PendingDirection {
                        from: track.side,
                        to: side,
                        since: now,
                    };
                    track.side = side;
                    arm = Some(PendingTimer {
                        deadline: now + persistence,
                        track: id,
                        generation: track.generation,
                    });
                }
            }
            TrackPhase::PendingDirection { from, to, .. } => {
                if side != to {
                    // Flicker back to the original side cancels the crossing;
                    // the stale timer resolves as a no-op.
                    debug!(track = %id, "pending crossing cancelled by flicker");
                    self.next_generation += 1;
                    track.generation = self.next_generation;
                    track.phase = TrackPhase::Unconfirmed;
                    track.side = from;
                }
            }
        }

        if let Some(timer) = arm {
            self.timers.push(Reverse(timer));
        }
    }

    fn sweep(&mut self, now: Instant) {
        let silence = self.config.silence();
        self.tracks.retain(|id, track| {
            if now.saturating_duration_since(track.last_seen) >= silence {
                if matches!(track.phase, TrackPhase::PendingDirection { .. }) {
                    debug!(track = %id, "partial crossing discarded on silence");
                }
                return false;
            }
            !matches!(track.phase, TrackPhase::Cooldown { until } if until <= now)
        });
    }

    fn emit(
        &mut self,
        track_id: TrackId,
        class: ObjectClass,
        direction: Direction,
        at: Instant,
    ) -> CountEvent {
        match direction {
            Direction::Inbound => self.totals.inbound += 1,
            Direction::Outbound => self.totals.outbound += 1,
        }
        *self.totals.by_class.entry(class).or_default() += 1;

        let event = CountEvent {
            id: self.next_event_id,
            direction,
            timestamp: self.wall_time(at),
            track_id,
            class,
            metadata: EventMetadata {
                plate: self.plate.clone(),
                inbound_total: self.totals.inbound,
                outbound_total: self.totals.outbound,
            },
        };
        self.next_event_id += 1;
        self.last_event = Some(event.clone());

        metrics::counter!("dock_events_total", "direction" => direction.label()).increment(1);
        info!(
            event_id = event.id,
            track = %track_id,
            class = class.label(),
            direction = direction.label(),
            inbound = self.totals.inbound,
            outbound = self.totals.outbound,
            "crossing counted"
        );
        event
    }

    fn wall_time(&self, at: Instant) -> DateTime<Utc> {
        let (anchor, wall) = self.epoch;
        match at.checked_duration_since(anchor) {
            Some(ahead) => wall + TimeDelta::from_std(ahead).unwrap_or_default(),
            None => wall - TimeDelta::from_std(anchor - at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: (u32, u32) = (100, 100);

    fn config() -> CrossingConfig {
        CrossingConfig {
            persistence_secs: 3.0,
            cooldown_secs: 5.0,
            silence_secs: 10.0,
            ..CrossingConfig::default()
        }
    }

    fn at(t0: Instant, secs: f64) -> Instant {
        t0 + Duration::from_secs_f64(secs)
    }

    fn detection(side: Side, confidence: f32) -> Detection {
        let bbox = match side {
            Side::Above => [40.0, 0.0, 60.0, 20.0],
            Side::Below => [40.0, 80.0, 60.0, 100.0],
            Side::Unknown => [40.0, 45.0, 60.0, 55.0],
        };
        Detection {
            class: ObjectClass::Truck,
            bbox,
            confidence,
            timestamp_ms: 0,
        }
    }

    fn batch(now: Instant, observations: &[(u64, Side)]) -> DetectionBatch {
        DetectionBatch {
            frame_size: FRAME,
            captured_at: now,
            detections: observations
                .iter()
                .map(|&(id, side)| TrackedDetection {
                    track_id: TrackId(id),
                    detection: detection(side, 0.9),
                })
                .collect(),
        }
    }

    fn observe(
        machine: &mut CrossingStateMachine,
        t0: Instant,
        secs: f64,
        id: u64,
        side: Side,
    ) -> Vec<CountEvent> {
        machine.observe(&batch(at(t0, secs), &[(id, side)]))
    }

    #[test]
    fn test_crossing_confirms_after_persistence_and_cooldown_blocks_recount() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();

        assert!(observe(&mut machine, t0, 0.0, 1, Side::Above).is_empty());
        assert!(observe(&mut machine, t0, 1.0, 1, Side::Below).is_empty());
        assert!(observe(&mut machine, t0, 2.0, 1, Side::Below).is_empty());
        assert!(observe(&mut machine, t0, 3.0, 1, Side::Below).is_empty());
        assert!(machine.tick(at(t0, 3.9)).is_empty());

        let events = machine.tick(at(t0, 4.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Inbound);
        assert_eq!(events[0].id, 1);
        assert!(machine.track(TrackId(1)).unwrap().confirmed);

        assert!(observe(&mut machine, t0, 6.0, 1, Side::Above).is_empty());
        assert!(observe(&mut machine, t0, 7.0, 1, Side::Below).is_empty());
        assert!(observe(&mut machine, t0, 8.0, 1, Side::Above).is_empty());
        assert!(machine.tick(at(t0, 9.0)).is_empty());
        assert!(machine.track(TrackId(1)).is_none());

        assert!(observe(&mut machine, t0, 9.5, 1, Side::Above).is_empty());
        assert!(observe(&mut machine, t0, 10.0, 1, Side::Below).is_empty());
        let events = machine.tick(at(t0, 13.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 2);
        assert_eq!(machine.snapshot().totals.inbound, 2);
    }

    #[test]
    fn test_out_of_order_batch_does_not_rewind_last_seen() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 1, Side::Above);
        observe(&mut machine, t0, 5.0, 1, Side::Above);
        observe(&mut machine, t0, 2.0, 1, Side::Above);
        assert_eq!(machine.track(TrackId(1)).unwrap().last_seen, at(t0, 5.0));

        machine.tick(at(t0, 14.0));
        assert!(machine.track(TrackId(1)).is_some());
    }

    #[test]
    fn test_flicker_back_within_window_emits_nothing() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 7, Side::Above);
        observe(&mut machine, t0, 1.0, 7, Side::Below);
        observe(&mut machine, t0, 2.0, 7, Side::Above);
        observe(&mut machine, t0, 2.5, 7, Side::Above);
        assert!(machine.tick(at(t0, 8.0)).is_empty());
        assert_eq!(machine.snapshot().totals, CountTotals::default());
    }

    #[test]
    fn test_timer_restarts_on_every_reflip() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 3, Side::Above);
        observe(&mut machine, t0, 1.0, 3, Side::Below);
        observe(&mut machine, t0, 2.0, 3, Side::Above);
        observe(&mut machine, t0, 2.5, 3, Side::Below);
        assert!(machine.tick(at(t0, 4.5)).is_empty());
        assert_eq!(machine.tick(at(t0, 5.5)).len(), 1);
    }

    #[test]
    fn test_dead_band_does_not_cancel_pending_crossing() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 4, Side::Above);
        observe(&mut machine, t0, 1.0, 4, Side::Below);
        observe(&mut machine, t0, 2.0, 4, Side::Unknown);
        assert_eq!(machine.tick(at(t0, 4.0)).len(), 1);
    }

    #[test]
    fn test_direction_mapping_is_configurable() {
        let mut config = config();
        config.directions = DirectionMap::default().inverted();
        let mut machine = CrossingStateMachine::new(config);
        let t0 = Instant::now();
        machine.observe(&batch(at(t0, 0.0), &[(1, Side::Above), (2, Side::Below)]));
        machine.observe(&batch(at(t0, 1.0), &[(1, Side::Below), (2, Side::Above)]));
        let events = machine.tick(at(t0, 5.0));
        let directions: Vec<_> = events.iter().map(|e| (e.track_id, e.direction)).collect();
        assert!(directions.contains(&(TrackId(1), Direction::Outbound)));
        assert!(directions.contains(&(TrackId(2), Direction::Inbound)));
    }

    #[test]
    fn test_silent_pending_track_is_discarded() {
        let mut config = config();
        config.silence_secs = 2.0;
        let mut machine = CrossingStateMachine::new(config);
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 9, Side::Above);
        observe(&mut machine, t0, 1.0, 9, Side::Below);
        assert!(machine.tick(at(t0, 4.0)).is_empty());
        assert!(machine.track(TrackId(9)).is_none());
    }

    #[test]
    fn test_events_follow_deadline_order() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        machine.observe(&batch(at(t0, 0.0), &[(1, Side::Above), (2, Side::Above)]));
        observe(&mut machine, t0, 1.0, 2, Side::Below);
        observe(&mut machine, t0, 1.5, 1, Side::Below);
        let events = machine.tick(at(t0, 5.0));
        let order: Vec<_> = events.iter().map(|e| (e.id, e.track_id)).collect();
        assert_eq!(order, vec![(1, TrackId(2)), (2, TrackId(1))]);
        assert!(events[0].timestamp < events[1].timestamp);
    }

    #[test]
    fn test_disabling_drops_tracks_and_ignores_detections() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 1, Side::Above);
        observe(&mut machine, t0, 1.0, 1, Side::Below);
        machine.apply(ControlCommand::SetCountingEnabled(false));
        assert_eq!(machine.track_count(), 0);
        observe(&mut machine, t0, 2.0, 1, Side::Above);
        assert_eq!(machine.track_count(), 0);
        assert!(machine.tick(at(t0, 6.0)).is_empty());

        machine.apply(ControlCommand::SetCountingEnabled(true));
        observe(&mut machine, t0, 7.0, 1, Side::Above);
        assert_eq!(machine.track_count(), 1);
    }

    #[test]
    fn test_reset_cooldown_releases_confirmed_tracks() {
        let mut machine = CrossingStateMachine::new(config());
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 1, Side::Above);
        observe(&mut machine, t0, 1.0, 1, Side::Below);
        assert_eq!(machine.tick(at(t0, 4.0)).len(), 1);
        assert_eq!(machine.snapshot().cooldown_tracks, 1);

        machine.apply(ControlCommand::ResetCooldown);
        assert_eq!(machine.snapshot().cooldown_tracks, 0);
        observe(&mut machine, t0, 4.5, 1, Side::Below);
        observe(&mut machine, t0, 5.0, 1, Side::Above);
        let events = machine.tick(at(t0, 8.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Outbound);
    }

    #[test]
    fn test_plate_and_totals_attached_to_events() {
        let mut machine = CrossingStateMachine::new(config());
        machine.apply(ControlCommand::SetPlate(Some(" KA01AB1234 ".into())));
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 1, Side::Above);
        observe(&mut machine, t0, 1.0, 1, Side::Below);
        let events = machine.tick(at(t0, 4.0));
        let metadata = &events[0].metadata;
        assert_eq!(metadata.plate.as_deref(), Some("KA01AB1234"));
        assert_eq!(metadata.inbound_total, 1);
        assert_eq!(metadata.outbound_total, 0);

        machine.apply(ControlCommand::ResetTotals);
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.totals.inbound, 0);
        assert!(snapshot.last_event.is_none());
    }

    #[test]
    fn test_low_confidence_and_uncounted_classes_are_ignored() {
        let mut config = config();
        config.counted_classes = vec![ObjectClass::Box];
        let mut machine = CrossingStateMachine::new(config);
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 1, Side::Above);
        assert_eq!(machine.track_count(), 0);

        let mut boxed = detection(Side::Above, 0.1);
        boxed.class = ObjectClass::Box;
        machine.observe(&DetectionBatch {
            frame_size: FRAME,
            captured_at: t0,
            detections: vec![TrackedDetection {
                track_id: TrackId(2),
                detection: boxed,
            }],
        });
        assert_eq!(machine.track_count(), 0);
    }

    #[test]
    fn test_shed_and_capacity_evict_oldest_unconfirmed() {
        let mut config = config();
        config.max_tracks = 2;
        let mut machine = CrossingStateMachine::new(config);
        let t0 = Instant::now();
        observe(&mut machine, t0, 0.0, 1, Side::Above);
        observe(&mut machine, t0, 0.1, 2, Side::Above);
        observe(&mut machine, t0, 0.2, 3, Side::Above);
        assert!(machine.track(TrackId(1)).is_none());
        assert!(machine.track(TrackId(3)).is_some());

        assert_eq!(machine.shed(5), 2);
        assert_eq!(machine.track_count(), 0);
        assert_eq!(machine.snapshot().shed_tracks, 3);
    }
}
