//! Latest-wins frame relay shared by the capture loop and every viewer.
//!
//! The capture loop is the only writer. Readers clone an `Arc` out of the
//! slot; the slot lock is held only for the pointer swap so slow MJPEG clients
//! never stall capture. Readers polling slower than capture simply skip frames.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use chrono::Utc;
use serde::Serialize;

/// Bounds for the history ring kept next to the latest slot.
pub const MIN_HISTORY_DEPTH: usize = 2;
pub const MAX_HISTORY_DEPTH: usize = 3;

const NO_UPDATE: i64 = i64::MIN;

/// One encoded frame as served to viewers.
#[derive(Debug)]
pub struct FramePacket {
    pub jpeg: Vec<u8>,
    pub timestamp_ms: i64,
    pub frame_number: u64,
    pub fps: f32,
    pub detection_count: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FrameStats {
    pub fps: f32,
    pub detection_count: usize,
    pub frame_count: u64,
    pub last_update_ms: Option<i64>,
    pub total_detections: u64,
    pub age_ms: Option<i64>,
    pub uptime_secs: f64,
}

/// Exponentially smoothed frame rate.
#[derive(Debug, Default)]
struct FpsMeter {
    last: Option<Instant>,
    smoothed: f32,
}

impl FpsMeter {
    fn observe(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.smoothed = if self.smoothed == 0.0 {
                    instant
                } else {
                    0.9 * self.smoothed + 0.1 * instant
                };
            }
        }
        self.last = Some(now);
        self.smoothed
    }
}

struct WriterState {
    meter: FpsMeter,
    frame_number: u64,
}

pub struct FrameBuffer {
    latest: Mutex<Option<Arc<FramePacket>>>,
    history: Mutex<VecDeque<Arc<FramePacket>>>,
    depth: usize,
    writer: Mutex<WriterState>,
    frame_count: AtomicU64,
    fps_bits: AtomicU32,
    detection_count: AtomicUsize,
    total_detections: AtomicU64,
    last_update_ms: AtomicI64,
    started: Instant,
}

impl FrameBuffer {
    /// Create a buffer keeping `depth` recent frames (clamped to 2..=3).
    pub fn new(depth: usize) -> Self {
        let depth = depth.clamp(MIN_HISTORY_DEPTH, MAX_HISTORY_DEPTH);
        Self {
            latest: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            writer: Mutex::new(WriterState {
                meter: FpsMeter::default(),
                frame_number: 0,
            }),
            frame_count: AtomicU64::new(0),
            fps_bits: AtomicU32::new(0),
            detection_count: AtomicUsize::new(0),
            total_detections: AtomicU64::new(0),
            last_update_ms: AtomicI64::new(NO_UPDATE),
            started: Instant::now(),
        }
    }

    /// Publish a new frame, replacing the latest slot. Returns its frame number.
    pub fn push(&self, jpeg: Vec<u8>, timestamp_ms: i64, detection_count: usize) -> u64 {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.frame_number += 1;
        let fps = writer.meter.observe(Instant::now());
        let packet = Arc::new(FramePacket {
            jpeg,
            timestamp_ms,
            frame_number: writer.frame_number,
            fps,
            detection_count,
        });

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.depth {
                history.pop_front();
            }
            history.push_back(packet.clone());
        }
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(packet);

        self.frame_count.fetch_add(1, Ordering::Relaxed);
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        self.detection_count.store(detection_count, Ordering::Relaxed);
        self.total_detections
            .fetch_add(detection_count as u64, Ordering::Relaxed);
        self.last_update_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        writer.frame_number
    }

    /// Newest frame, or `None` before the first push.
    pub fn latest(&self) -> Option<Arc<FramePacket>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Newest frame strictly newer than `frame_number`.
    pub fn frame_after(&self, frame_number: u64) -> Option<Arc<FramePacket>> {
        self.latest()
            .filter(|packet| packet.frame_number > frame_number)
    }

    /// Look up a recent frame by sequence number.
    pub fn frame(&self, frame_number: u64) -> Option<Arc<FramePacket>> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|packet| packet.frame_number == frame_number)
            .cloned()
    }

    /// Drop buffered frames. Frame numbering keeps increasing.
    pub fn clear(&self) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.detection_count.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FrameStats {
        let last = self.last_update_ms.load(Ordering::Relaxed);
        let last_update_ms = (last != NO_UPDATE).then_some(last);
        FrameStats {
            fps: f32::from_bits(self.fps_bits.load(Ordering::Relaxed)),
            detection_count: self.detection_count.load(Ordering::Relaxed),
            frame_count: self.frame_count.load(Ordering::Relaxed),
            last_update_ms,
            total_detections: self.total_detections.load(Ordering::Relaxed),
            age_ms: last_update_ms.map(|ms| (Utc::now().timestamp_millis() - ms).max(0)),
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(MAX_HISTORY_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn test_latest_is_empty_before_first_push() {
        let buffer = FrameBuffer::default();
        assert!(buffer.latest().is_none());
        let stats = buffer.stats();
        assert_eq!(stats.frame_count, 0);
        assert!(stats.last_update_ms.is_none());
    }

    #[test]
    fn test_push_updates_latest_and_stats() {
        let buffer = FrameBuffer::default();
        buffer.push(vec![1], 10, 2);
        let number = buffer.push(vec![2], 20, 3);
        let latest = buffer.latest().unwrap();
        assert_eq!(latest.frame_number, number);
        assert_eq!(latest.jpeg, vec![2]);

        let stats = buffer.stats();
        assert_eq!(stats.frame_count, 2);
        assert_eq!(stats.detection_count, 3);
        assert_eq!(stats.total_detections, 5);
        assert!(stats.last_update_ms.is_some());
    }

    #[test]
    fn test_history_depth_is_clamped() {
        let buffer = FrameBuffer::new(10);
        for i in 0..6 {
            buffer.push(vec![i], i as i64, 0);
        }
        assert!(buffer.frame(3).is_none());
        assert!(buffer.frame(4).is_some());
        assert!(buffer.frame(6).is_some());

        let shallow = FrameBuffer::new(0);
        shallow.push(vec![0], 0, 0);
        shallow.push(vec![1], 1, 0);
        shallow.push(vec![2], 2, 0);
        assert!(shallow.frame(1).is_none());
        assert!(shallow.frame(2).is_some());
    }

    #[test]
    fn test_frame_after_skips_already_seen_frames() {
        let buffer = FrameBuffer::default();
        let first = buffer.push(vec![0], 0, 0);
        assert!(buffer.frame_after(first).is_none());
        let second = buffer.push(vec![1], 1, 0);
        assert_eq!(buffer.frame_after(first).unwrap().frame_number, second);
    }

    #[test]
    fn test_clear_empties_slot() {
        let buffer = FrameBuffer::default();
        let first = buffer.push(vec![0], 0, 4);
        buffer.clear();
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.stats().detection_count, 0);
        assert_eq!(buffer.push(vec![1], 1, 0), first + 1);
    }

    #[test]
    fn test_fps_meter_smooths_intervals() {
        let mut meter = FpsMeter::default();
        let t0 = Instant::now();
        assert_eq!(meter.observe(t0), 0.0);
        let first = meter.observe(t0 + Duration::from_millis(100));
        assert!((first - 10.0).abs() < 0.01);
        let second = meter.observe(t0 + Duration::from_millis(150));
        assert!((second - (0.9 * 10.0 + 0.1 * 20.0)).abs() < 0.01);
    }

    #[test]
    fn test_concurrent_readers_see_recent_frames() {
        let buffer = Arc::new(FrameBuffer::default());
        let published = Arc::new(AtomicU64::new(0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                let published = published.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let before = published.load(Ordering::SeqCst);
                        match buffer.latest() {
                            Some(packet) => assert!(packet.frame_number >= before),
                            None => assert_eq!(before, 0),
                        }
                    }
                })
            })
            .collect();

        for i in 0..2_000u64 {
            let number = buffer.push(vec![0; 16], i as i64, 1);
            published.store(number, Ordering::SeqCst);
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.stats().frame_count, 2_000);
    }
}
