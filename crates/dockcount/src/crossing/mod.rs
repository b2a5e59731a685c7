//! Counting: line geometry, association and the crossing state machine.

pub mod association;
pub mod line;
pub mod machine;
pub mod worker;

pub use association::{Associator, IouAssociator};
pub use line::{CountingLine, LineOrientation};
pub use machine::{
    ControlCommand, CountTotals, CountingSnapshot, CrossingConfig, CrossingStateMachine,
    DetectionBatch, DirectionMap, Track, TrackPhase, TrackedDetection,
};
pub use worker::{CrossingHandle, spawn_crossing_worker};
