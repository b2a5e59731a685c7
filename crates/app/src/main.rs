mod cli;
mod control;
mod detector;
mod server;
mod sinks;

use std::sync::{Arc, atomic::AtomicBool};

use anyhow::Result;
use clap::Parser;
use dockcount::{
    pipeline::{self, PipelineParts, telemetry},
    sync::ControlSource,
};
use tracing::info;
use video_ingest::FfmpegSource;

use crate::{
    cli::{AppConfig, CliArgs},
    control::HttpControlSource,
    sinks::{DashboardFeed, FEED_CAPACITY},
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = AppConfig::try_from(CliArgs::parse())?;
    let _telemetry_guard = telemetry::enter_runtime(&config.dock.telemetry);
    let prometheus = telemetry::init_metrics_recorder();
    metrics::gauge!("dock_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    let shutdown = Arc::new(AtomicBool::new(false));
    pipeline::install_ctrlc_handler(shutdown.clone());

    let feed = Arc::new(DashboardFeed::new(FEED_CAPACITY));
    let sinks = sinks::build_sinks(&config, feed.clone())?;
    let detector = detector::build_detector(config.detector_url.as_deref())?;
    let mut control_sources: Vec<Box<dyn ControlSource>> = Vec::new();
    if let Some(url) = &config.control_url {
        control_sources.push(Box::new(HttpControlSource::new(
            sinks::http_client()?,
            url.clone(),
        )));
    }
    let capture = &config.dock.capture;
    let source = FfmpegSource::new(
        capture.source.clone(),
        (capture.width, capture.height),
        capture.target_fps,
    );

    let handle = pipeline::start(
        &config.dock,
        PipelineParts {
            source: Box::new(source),
            detector,
            associator: None,
            sinks,
            control_sources,
        },
        shutdown,
    )?;
    let server = server::spawn_server(config.bind, handle.sync().clone(), feed, Some(prometheus))?;
    info!(
        "HTTP preview available at http://{}/stream.mjpg; press Ctrl+C to stop",
        config.bind
    );

    handle.wait();
    server.stop();
    Ok(())
}
