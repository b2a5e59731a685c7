//! FFmpeg subprocess source decoding any supported input into raw RGB frames.

use std::{
    io::Read,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::debug;

use crate::{
    camera::{SourceKind, parse_device_index},
    source::FrameSource,
    types::{CaptureError, Frame, FrameFormat},
};

/// Frames buffered between the reader thread and the capture loop.
const READER_QUEUE_DEPTH: usize = 2;

/// Video source backed by an `ffmpeg` child process writing `rgb24` to stdout.
pub struct FfmpegSource {
    uri: String,
    size: (u32, u32),
    fps: f64,
    child: Option<Arc<Mutex<Child>>>,
    frames: Option<Receiver<Result<Frame, CaptureError>>>,
}

impl FfmpegSource {
    /// `fps` caps the decoder's output rate so frames never queue up behind a
    /// slower consumer; zero or less leaves the source rate untouched.
    pub fn new(uri: impl Into<String>, size: (u32, u32), fps: f64) -> Self {
        Self {
            uri: uri.into(),
            size,
            fps,
            child: None,
            frames: None,
        }
    }
}

impl FrameSource for FfmpegSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        self.close();

        let mut cmd = Command::new("ffmpeg");
        cmd.args(ffmpeg_args(&self.uri, self.size, self.fps))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|err| CaptureError::Open {
            uri: self.uri.clone(),
            reason: err.to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        let child = Arc::new(Mutex::new(child));
        let (tx, rx) = bounded(READER_QUEUE_DEPTH);
        let reader_child = child.clone();
        let size = self.size;
        thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || {
                if let Err(err) = ffmpeg_loop(stdout, size, &tx) {
                    let _ = tx.send(Err(err));
                }
                kill_child(&reader_child);
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        debug!(uri = %self.uri, "ffmpeg reader started");
        self.child = Some(child);
        self.frames = Some(rx);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let frames = self.frames.as_ref().ok_or(CaptureError::NotOpen)?;
        match frames.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::EndOfStream),
        }
    }

    fn close(&mut self) {
        self.frames = None;
        if let Some(child) = self.child.take() {
            kill_child(&child);
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn kill_child(child: &Mutex<Child>) {
    if let Ok(mut child) = child.lock() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Build the FFmpeg argument list for a source URI.
fn ffmpeg_args(uri: &str, size: (u32, u32), fps: f64) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();

    let input = match SourceKind::from_uri(uri) {
        SourceKind::Rtsp => {
            args.extend(
                [
                    "-rtsp_transport",
                    "tcp",
                    "-fflags",
                    "nobuffer",
                    "-flags",
                    "low_delay",
                ]
                .map(String::from),
            );
            uri.to_string()
        }
        SourceKind::Http => {
            args.extend(["-fflags", "nobuffer"].map(String::from));
            uri.to_string()
        }
        SourceKind::Device => {
            args.extend(["-f", "video4linux2"].map(String::from));
            match parse_device_index(uri) {
                Some(index) if !uri.starts_with("/dev/") => format!("/dev/video{index}"),
                _ => uri.to_string(),
            }
        }
        SourceKind::File => {
            args.push("-re".into());
            uri.to_string()
        }
    };

    let scale = format!("scale={}:{}", size.0, size.1);
    let filters = if fps > 0.0 {
        format!("fps={fps},{scale}")
    } else {
        scale
    };

    args.push("-i".into());
    args.push(input);
    args.extend([
        "-an".to_string(),
        "-vf".to_string(),
        filters,
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-".to_string(),
    ]);
    args
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    size: (u32, u32),
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = Frame::expected_len(size.0, size.1, FrameFormat::Rgb8);
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        stdout
            .read_exact(&mut buffer)
            .map_err(|err| CaptureError::Other(err.into()))?;
        let frame = Frame {
            data: buffer.clone(),
            width: size.0,
            height: size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        };
        if tx.send(Ok(frame)).is_err() {
            return Ok(());
        }
    }
}
