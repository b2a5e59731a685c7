//! Actix Web server exposing the live preview, snapshots, the event feed and
//! the control endpoint.
//!
//! The server runs on a dedicated thread so the pipeline threads never touch
//! the async runtime. Every handler reads published snapshots only.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use dockcount::{
    ControlError, FrameBuffer, FramePacket, crossing::ControlCommand,
    pipeline::telemetry, sync::PollingSync,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::error;

use crate::sinks::DashboardFeed;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) sync: Arc<PollingSync>,
    pub(crate) feed: Arc<DashboardFeed>,
    pub(crate) prometheus: Option<&'static PrometheusHandle>,
}

impl ServerState {
    fn frames(&self) -> &Arc<FrameBuffer> {
        self.sync.frames()
    }
}

#[derive(Default)]
/// Handle for the server thread.
pub(crate) struct HttpServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HttpServerHandle {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct FrameQuery {
    frame: Option<u64>,
}

/// Spawn the server thread and return a handle that can stop it.
pub(crate) fn spawn_server(
    bind: SocketAddr,
    sync: Arc<PollingSync>,
    feed: Arc<DashboardFeed>,
    prometheus: Option<&'static PrometheusHandle>,
) -> Result<HttpServerHandle> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    // Bind before spawning so an occupied port fails startup.
    let listener = std::net::TcpListener::bind(bind)
        .with_context(|| format!("failed to bind HTTP server to {bind}"))?;
    let handle = telemetry::spawn_thread("dock-http", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        sync: sync.clone(),
                        feed: feed.clone(),
                        prometheus,
                    }))
                    .route("/frame.jpg", web::get().to(frame_handler))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/api/snapshot", web::get().to(snapshot_handler))
                    .route("/api/stats", web::get().to(stats_handler))
                    .route("/api/events", web::get().to(events_handler))
                    .route("/api/control", web::post().to(control_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .workers(2)
            .listen(listener)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;
    Ok(HttpServerHandle {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn jpeg_response(packet: &FramePacket) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("image/jpeg")
        .append_header(("X-Sequence", packet.frame_number.to_string()))
        .append_header(("Cache-Control", "no-cache"))
        .body(packet.jpeg.clone())
}

/// Return a single JPEG frame by sequence number or the latest frame.
async fn frame_handler(
    query: web::Query<FrameQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let frames = state.frames();
    if let Some(requested) = query.frame {
        if let Some(packet) = frames.frame(requested) {
            return jpeg_response(&packet);
        }
        return match frames.latest() {
            Some(latest) => {
                let mut response = jpeg_response(&latest);
                if let Ok(value) = header::HeaderValue::from_str(&format!(
                    "299 dockcount \"frame {} not buffered; returning latest {}\"",
                    requested, latest.frame_number
                )) {
                    response.headers_mut().insert(header::WARNING, value);
                }
                response
            }
            None => HttpResponse::NoContent().finish(),
        };
    }

    match frames.latest() {
        Some(packet) => jpeg_response(&packet),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the MJPEG feed over a multipart response, skipping repeated frames.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        let mut last_sent = 0u64;
        loop {
            interval.tick().await;
            if let Some(packet) = state.frames().frame_after(last_sent) {
                last_sent = packet.frame_number;
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 96);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", packet.frame_number).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
                payload.extend_from_slice(
                    format!("Content-Length: {}\r\n\r\n", packet.jpeg.len()).as_bytes(),
                );
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Full snapshot as published by the sync loop.
async fn snapshot_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .json(state.sync.latest())
}

/// Lightweight stats for overlays that poll frequently.
async fn stats_handler(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = state.sync.latest();
    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .json(json!({
            "fps": snapshot.frames.fps,
            "frame_count": snapshot.frames.frame_count,
            "detection_count": snapshot.frames.detection_count,
            "age_ms": snapshot.frames.age_ms,
            "capture_status": snapshot.capture.status,
            "counting_enabled": snapshot.counting.enabled,
            "inbound": snapshot.counting.totals.inbound,
            "outbound": snapshot.counting.totals.outbound,
        }))
}

/// Stream count events as Server-Sent Events.
async fn events_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 1000\n\n"));
        let mut last_id = state.feed.latest_id();
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(250));
        let mut idle_ticks = 0u32;
        loop {
            interval.tick().await;
            let events = state.feed.since(last_id);
            if events.is_empty() {
                idle_ticks += 1;
                if idle_ticks % 60 == 0 {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                }
                continue;
            }
            idle_ticks = 0;
            for event in events {
                last_id = Some(event.id);
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        let chunk = format!("id: {}\nevent: count\ndata: {json}\n\n", event.id);
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                    Err(err) => {
                        let chunk = format!("event: error\ndata: {err}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

/// Forward a control command to the counting worker.
async fn control_handler(
    command: web::Json<ControlCommand>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    match state.sync.apply(command.into_inner()) {
        Ok(()) => HttpResponse::Accepted().json(json!({ "status": "accepted" })),
        Err(err @ ControlError::Busy) => HttpResponse::ServiceUnavailable()
            .json(json!({ "status": "busy", "error": err.to_string() })),
        Err(err @ ControlError::Stopped) => {
            HttpResponse::Gone().json(json!({ "status": "stopped", "error": err.to_string() }))
        }
    }
}

/// Prometheus text exposition.
async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}
