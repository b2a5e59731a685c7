use std::time::Duration;

use crate::types::{CaptureError, Frame};

/// Pull-based video source driven by the capture loop.
///
/// Implementations must be restartable: after [`FrameSource::close`] (or any
/// error from [`FrameSource::next_frame`]) the capture loop calls
/// [`FrameSource::open`] again to reconnect.
pub trait FrameSource: Send {
    /// Short description used in logs (usually the URI).
    fn describe(&self) -> &str;

    /// Connect to the source. Called before the first frame and on every reconnect.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Block for at most `timeout` waiting for the next decoded frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// Release the underlying connection. Must be idempotent.
    fn close(&mut self);
}
