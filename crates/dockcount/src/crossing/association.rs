//! Detection-to-track association.
//!
//! The counting core only needs `detection → track id`. [`IouAssociator`] is a
//! small greedy IoU matcher good enough for a fixed dock camera; a dedicated
//! tracker can replace it through the [`Associator`] trait.

use std::time::{Duration, Instant};

use crate::model::{Detection, ObjectClass, TrackId};

pub trait Associator: Send {
    /// Resolve each detection to a track id. `None` marks an association gap.
    fn associate(&mut self, detections: &[Detection], now: Instant) -> Vec<Option<TrackId>>;
}

#[derive(Clone, Debug)]
struct Candidate {
    id: TrackId,
    class: ObjectClass,
    bbox: [f32; 4],
    last_seen: Instant,
}

pub struct IouAssociator {
    tracks: Vec<Candidate>,
    next_id: u64,
    iou_threshold: f32,
    max_age: Duration,
}

impl IouAssociator {
    pub fn new(iou_threshold: f32, max_age: Duration) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_age,
        }
    }
}

impl Default for IouAssociator {
    fn default() -> Self {
        Self::new(0.3, Duration::from_secs(2))
    }
}

impl Associator for IouAssociator {
    fn associate(&mut self, detections: &[Detection], now: Instant) -> Vec<Option<TrackId>> {
        let max_age = self.max_age;
        self.tracks
            .retain(|track| now.saturating_duration_since(track.last_seen) <= max_age);

        let mut pairs = Vec::new();
        for (det_index, detection) in detections.iter().enumerate() {
            if !detection.is_well_formed() {
                continue;
            }
            for (track_index, track) in self.tracks.iter().enumerate() {
                if track.class != detection.class {
                    continue;
                }
                let overlap = iou(&track.bbox, &detection.bbox);
                if overlap >= self.iou_threshold {
                    pairs.push((overlap, det_index, track_index));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned = vec![None; detections.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, det_index, track_index) in pairs {
            if assigned[det_index].is_some() || track_taken[track_index] {
                continue;
            }
            track_taken[track_index] = true;
            let track = &mut self.tracks[track_index];
            track.bbox = detections[det_index].bbox;
            track.last_seen = now;
            assigned[det_index] = Some(track.id);
        }

        for (det_index, detection) in detections.iter().enumerate() {
            if assigned[det_index].is_some() || !detection.is_well_formed() {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            self.tracks.push(Candidate {
                id,
                class: detection.class,
                bbox: detection.bbox,
                last_seen: now,
            });
            assigned[det_index] = Some(id);
        }
        assigned
    }
}

pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;
    if union <= 0.0 { 0.0 } else { intersection / union }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: ObjectClass, bbox: [f32; 4]) -> Detection {
        Detection {
            class,
            bbox,
            confidence: 0.9,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_iou() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou(&[0.0, 0.0, 10.0, 10.0], &[0.0, 0.0, 10.0, 10.0]) - 1.0).abs() < 1e-6);
        assert!((iou(&[0.0, 0.0, 10.0, 10.0], &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_moving_box_keeps_its_id() {
        let mut associator = IouAssociator::default();
        let t0 = Instant::now();
        let first = associator.associate(&[det(ObjectClass::Truck, [0.0, 0.0, 100.0, 100.0])], t0);
        let second = associator.associate(
            &[det(ObjectClass::Truck, [10.0, 10.0, 110.0, 110.0])],
            t0 + Duration::from_millis(100),
        );
        assert_eq!(first, second);
        assert!(first[0].is_some());
    }

    #[test]
    fn test_class_mismatch_and_age_create_new_ids() {
        let mut associator = IouAssociator::default();
        let t0 = Instant::now();
        let truck = associator.associate(&[det(ObjectClass::Truck, [0.0, 0.0, 50.0, 50.0])], t0);
        let person = associator.associate(&[det(ObjectClass::Person, [0.0, 0.0, 50.0, 50.0])], t0);
        assert_ne!(truck, person);

        let later = associator.associate(
            &[det(ObjectClass::Truck, [0.0, 0.0, 50.0, 50.0])],
            t0 + Duration::from_secs(10),
        );
        assert_ne!(truck, later);
    }

    #[test]
    fn test_malformed_boxes_are_gaps() {
        let mut associator = IouAssociator::default();
        let ids = associator.associate(
            &[
                det(ObjectClass::Box, [10.0, 10.0, 5.0, 20.0]),
                det(ObjectClass::Box, [0.0, 0.0, 5.0, 5.0]),
            ],
            Instant::now(),
        );
        assert_eq!(ids[0], None);
        assert!(ids[1].is_some());
    }
}
