//! Command line parsing for the `dockcount` binary.
//!
//! Flags fall back to environment variables, then to the optional JSON config
//! file, then to built-in defaults. `AppConfig` is validated once here so the
//! pipeline never re-parses flags.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use dockcount::{
    crossing::LineOrientation,
    pipeline::{DockConfig, TelemetryOptions},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OrientationArg {
    Horizontal,
    Vertical,
}

impl From<OrientationArg> for LineOrientation {
    fn from(value: OrientationArg) -> Self {
        match value {
            OrientationArg::Horizontal => LineOrientation::Horizontal,
            OrientationArg::Vertical => LineOrientation::Vertical,
        }
    }
}

/// Loading-dock crossing counter.
#[derive(Debug, Parser)]
#[command(name = "dockcount", version, about)]
pub struct CliArgs {
    /// JSON configuration file supplying defaults.
    #[arg(long, value_name = "PATH", env = "DOCKCOUNT_CONFIG")]
    pub config: Option<PathBuf>,
    /// Camera URI, device path or index.
    #[arg(long = "source", value_name = "URI", env = "CAMERA_URL")]
    pub source: Option<String>,
    /// Address the HTTP server binds to.
    #[arg(long, value_name = "ADDR", env = "DOCKCOUNT_BIND", default_value = "0.0.0.0:5001")]
    pub bind: String,
    /// Capture width in pixels.
    #[arg(long, value_name = "PX", env = "CAPTURE_WIDTH")]
    pub width: Option<u32>,
    /// Capture height in pixels.
    #[arg(long, value_name = "PX", env = "CAPTURE_HEIGHT")]
    pub height: Option<u32>,
    /// Frames processed per second.
    #[arg(long, value_name = "FPS", env = "TARGET_FPS")]
    pub target_fps: Option<f64>,
    /// Preview JPEG quality (30-95).
    #[arg(long, value_name = "QUALITY", env = "JPEG_QUALITY")]
    pub jpeg_quality: Option<u8>,
    /// Seconds a track must stay across the line before it counts.
    #[arg(long, value_name = "SECS", env = "PERSISTENCE_SECS")]
    pub persistence_secs: Option<f64>,
    /// Seconds a counted track is ignored afterwards.
    #[arg(long, value_name = "SECS", env = "COOLDOWN_SECS")]
    pub cooldown_secs: Option<f64>,
    /// Seconds without detections before a track is forgotten.
    #[arg(long, value_name = "SECS", env = "SILENCE_SECS")]
    pub silence_secs: Option<f64>,
    /// Counting line position as a fraction of the frame.
    #[arg(long, value_name = "FRACTION", env = "LINE_POSITION")]
    pub line_position: Option<f32>,
    /// Counting line orientation.
    #[arg(long, value_enum, env = "LINE_ORIENTATION")]
    pub line_orientation: Option<OrientationArg>,
    /// Swap inbound and outbound for cameras mounted the other way round.
    #[arg(long, env = "INVERT_DIRECTION")]
    pub invert_direction: bool,
    /// Spreadsheet web app receiving count events.
    #[arg(long, value_name = "URL", env = "WEBAPP_URL")]
    pub sheets_url: Option<String>,
    /// Telegram bot token for event notifications.
    #[arg(long, value_name = "TOKEN", env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,
    /// Telegram chat receiving notifications.
    #[arg(long, value_name = "CHAT_ID", env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat: Option<String>,
    /// Inference endpoint accepting JPEG frames.
    #[arg(long, value_name = "URL", env = "DETECTOR_URL")]
    pub detector_url: Option<String>,
    /// Remote controller polled with snapshots.
    #[arg(long, value_name = "URL", env = "CONTROL_URL")]
    pub control_url: Option<String>,
    /// Append dead-lettered events to this JSON lines file.
    #[arg(long, value_name = "PATH", env = "DEAD_LETTER_PATH")]
    pub dead_letter_path: Option<PathBuf>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long, value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable debug logging.
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Clone, Debug)]
pub struct TelegramTarget {
    pub token: String,
    pub chat_id: String,
}

#[derive(Clone, Debug)]
/// Fully resolved configuration for one run of the binary.
pub struct AppConfig {
    pub dock: DockConfig,
    pub bind: SocketAddr,
    pub sheets_url: Option<String>,
    pub telegram: Option<TelegramTarget>,
    pub detector_url: Option<String>,
    pub control_url: Option<String>,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self> {
        let mut dock = match args.config.as_deref() {
            Some(path) => DockConfig::from_json_file(path)?,
            None => DockConfig::default(),
        };

        let capture = &mut dock.capture;
        if let Some(source) = args.source {
            capture.source = source;
        }
        if let Some(width) = args.width {
            capture.width = width;
        }
        if let Some(height) = args.height {
            capture.height = height;
        }
        if let Some(fps) = args.target_fps {
            capture.target_fps = fps;
        }
        if let Some(quality) = args.jpeg_quality {
            capture.jpeg_quality = quality;
        }

        let crossing = &mut dock.crossing;
        if let Some(secs) = args.persistence_secs {
            crossing.persistence_secs = secs;
        }
        if let Some(secs) = args.cooldown_secs {
            crossing.cooldown_secs = secs;
        }
        if let Some(secs) = args.silence_secs {
            crossing.silence_secs = secs;
        }
        if let Some(position) = args.line_position {
            crossing.line.position = position;
        }
        if let Some(orientation) = args.line_orientation {
            crossing.line.orientation = orientation.into();
        }
        if args.invert_direction {
            crossing.directions = crossing.directions.inverted();
        }

        if args.dead_letter_path.is_some() {
            dock.dispatch.dead_letter_path = args.dead_letter_path;
        }
        dock.telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
            verbose: args.verbose,
        };
        dock.validate()?;

        let bind = args
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid --bind address {:?}", args.bind))?;

        let telegram = match (non_empty(args.telegram_token), non_empty(args.telegram_chat)) {
            (Some(token), Some(chat_id)) => Some(TelegramTarget { token, chat_id }),
            (None, None) => None,
            _ => bail!("--telegram-token and --telegram-chat must be provided together"),
        };

        let sheets_url = non_empty(args.sheets_url);
        let detector_url = non_empty(args.detector_url);
        let control_url = non_empty(args.control_url);
        for url in [&sheets_url, &detector_url, &control_url].into_iter().flatten() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("expected an http(s) URL, got {url:?}");
            }
        }

        Ok(Self {
            dock,
            bind,
            sheets_url,
            telegram,
            detector_url,
            control_url,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use dockcount::Direction;

    use super::*;

    fn parse(args: &[&str]) -> Result<AppConfig> {
        let mut argv = vec!["dockcount"];
        argv.extend_from_slice(args);
        AppConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--source",
            "rtsp://cam/1",
            "--target-fps",
            "10",
            "--persistence-secs",
            "2",
            "--line-orientation",
            "vertical",
            "--invert-direction",
            "--bind",
            "127.0.0.1:8080",
        ])
        .unwrap();
        assert_eq!(config.dock.capture.source, "rtsp://cam/1");
        assert_eq!(config.dock.capture.target_fps, 10.0);
        assert_eq!(config.dock.crossing.persistence_secs, 2.0);
        assert_eq!(config.dock.crossing.line.orientation, LineOrientation::Vertical);
        assert_eq!(
            config.dock.crossing.directions.above_to_below,
            Direction::Outbound
        );
        assert_eq!(config.bind.port(), 8080);
    }

    #[test]
    fn test_telegram_requires_token_and_chat() {
        let err = parse(&["--telegram-token", "abc"]).unwrap_err();
        assert!(err.to_string().contains("--telegram-chat"));

        let config = parse(&["--telegram-token", "abc", "--telegram-chat", "42"]).unwrap();
        let telegram = config.telegram.unwrap();
        assert_eq!(telegram.chat_id, "42");
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(parse(&["--jpeg-quality", "99"]).is_err());
        assert!(parse(&["--bind", "not-an-address"]).is_err());
        assert!(parse(&["--sheets-url", "ftp://example"]).is_err());
    }

    #[test]
    fn test_config_file_supplies_defaults() {
        let path = std::env::temp_dir().join(format!("dockcount-cli-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"capture": {"source": "http://cam/stream", "jpeg_quality": 80},
                "crossing": {"cooldown_secs": 8}}"#,
        )
        .unwrap();
        let config = parse(&["--config", path.to_str().unwrap(), "--jpeg-quality", "70"]).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.dock.capture.source, "http://cam/stream");
        assert_eq!(config.dock.capture.jpeg_quality, 70);
        assert_eq!(config.dock.crossing.cooldown_secs, 8.0);
    }
}
