//! Video sources for the dock counter.
//!
//! A [`FrameSource`] yields decoded RGB frames on demand. The FFmpeg-backed
//! implementation covers RTSP cameras, HTTP/MJPEG feeds, recorded files and
//! local V4L devices.

mod camera;
mod ffmpeg;
mod source;
mod types;

pub use camera::{SourceKind, parse_device_index};
pub use ffmpeg::FfmpegSource;
pub use source::FrameSource;
pub use types::{CaptureError, Frame, FrameFormat};
