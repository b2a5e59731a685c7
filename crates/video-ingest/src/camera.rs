//! Source URI classification helpers.

/// Ingress transport inferred from a source URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local V4L device, by index or `/dev/videoN` path.
    Device,
    /// Real-time streaming protocol feed.
    Rtsp,
    /// HTTP(S) feed such as an MJPEG camera endpoint.
    Http,
    /// Anything else is handed to FFmpeg as a file path.
    File,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Http
        } else if parse_device_index(uri).is_some() {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }
}

/// Parse `0`, `1`, ... or `/dev/videoN` into a V4L device index.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}
