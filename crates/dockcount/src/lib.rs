//! Loading-dock crossing counter.
//!
//! The crate is split into focused modules:
//! - `frame_buffer`: latest-wins frame relay for viewers.
//! - `crossing`: line geometry, track association and the persistence/cooldown
//!   state machine that confirms directional crossings.
//! - `dispatch`: per-sink queues, circuit breakers and delivery workers.
//! - `pipeline`: capture loop, configuration, telemetry, watchdog and the
//!   supervisor wiring every stage together.
//! - `sync`: snapshot and control surface for remote controllers.

pub mod crossing;
pub mod dispatch;
pub mod error;
pub mod frame_buffer;
pub mod model;
pub mod pipeline;
pub mod sync;

pub use error::{ControlError, Fault};
pub use frame_buffer::{FrameBuffer, FramePacket, FrameStats};
pub use model::{CountEvent, Detection, Direction, EventMetadata, ObjectClass, Side, TrackId};
