//! Detector clients plugged into the capture loop.

use anyhow::{Context, Result, anyhow, bail};
use dockcount::{
    Detection, ObjectClass,
    pipeline::{Detector, annotation::encode_jpeg},
};
use image::RgbImage;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::warn;
use video_ingest::Frame;

use crate::sinks::http_client;

/// JPEG quality of frames sent for inference.
const INFERENCE_JPEG_QUALITY: u8 = 85;

pub fn build_detector(url: Option<&str>) -> Result<Box<dyn Detector>> {
    match url {
        Some(url) => Ok(Box::new(HttpDetector::new(http_client()?, url.to_string()))),
        None => {
            warn!("no detector configured; frames are streamed without counting");
            Ok(Box::new(NullDetector))
        }
    }
}

/// Posts each frame as JPEG to an inference service.
pub struct HttpDetector {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(alias = "class", alias = "name")]
    label: String,
    /// `x1, y1, x2, y2` in frame pixels.
    bbox: [f32; 4],
    #[serde(alias = "score")]
    confidence: f32,
}

impl HttpDetector {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

impl Detector for HttpDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let image = RgbImage::from_vec(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| {
                anyhow!(
                    "frame buffer does not match {}x{}",
                    frame.width,
                    frame.height
                )
            })?;
        let jpeg = encode_jpeg(&image, INFERENCE_JPEG_QUALITY)?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .with_context(|| format!("inference request to {} failed", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("inference service returned HTTP {status}");
        }
        let body = response
            .text()
            .context("failed to read inference response")?;
        parse_detections(&body, frame.timestamp_ms)
    }
}

/// Decode an inference response, dropping labels the dock does not count.
pub(crate) fn parse_detections(body: &str, timestamp_ms: i64) -> Result<Vec<Detection>> {
    let response: InferenceResponse =
        serde_json::from_str(body).context("malformed inference response")?;
    Ok(response
        .detections
        .into_iter()
        .filter_map(|raw| {
            let class = ObjectClass::from_label(&raw.label)?;
            Some(Detection {
                class,
                bbox: raw.bbox,
                confidence: raw.confidence,
                timestamp_ms,
            })
        })
        .collect())
}

/// Detector used when no inference service is configured.
pub struct NullDetector;

impl Detector for NullDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
