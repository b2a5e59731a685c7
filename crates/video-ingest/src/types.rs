use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw RGB frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Expected byte length for a frame of the given dimensions.
    pub fn expected_len(width: u32, height: u32, format: FrameFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    #[error("video source is not open")]
    NotOpen,
    #[error("no frame received within {0:?}")]
    Timeout(Duration),
    #[error("video source ended")]
    EndOfStream,
    #[error(transparent)]
    Other(#[from] Error),
}
