//! Frame annotation and JPEG encoding for the live preview.

use anyhow::{Result, anyhow, bail};
use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use video_ingest::Frame;

use crate::{
    crossing::{CountingLine, LineOrientation},
    model::{Detection, ObjectClass, TrackId},
    pipeline::config::{MAX_JPEG_QUALITY, MIN_JPEG_QUALITY},
};

const GLYPH_ADVANCE: i32 = 6;
const LINE_COLOR: Rgb<u8> = Rgb([255, 210, 0]);
const BAND_COLOR: Rgb<u8> = Rgb([140, 115, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const SHADE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Everything drawn on top of a captured frame.
pub struct Overlay<'a> {
    pub detections: &'a [Detection],
    /// Parallel to `detections`; `None` for association gaps.
    pub track_ids: &'a [Option<TrackId>],
    pub line: &'a CountingLine,
    pub inbound: u64,
    pub outbound: u64,
    pub fps: f32,
    pub counting_enabled: bool,
}

/// Draw the overlay onto a copy of the frame and encode it as JPEG.
pub fn annotate_frame(frame: &Frame, overlay: &Overlay<'_>, jpeg_quality: u8) -> Result<Vec<u8>> {
    let expected = Frame::expected_len(frame.width, frame.height, frame.format);
    if frame.data.len() != expected {
        bail!(
            "frame buffer has {} bytes, expected {expected} for {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        );
    }
    let mut image: RgbImage =
        ImageBuffer::from_vec(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    draw_counting_line(&mut image, overlay.line);

    for (index, detection) in overlay.detections.iter().enumerate() {
        if !detection.is_well_formed() {
            continue;
        }
        let color = class_color(detection.class);
        let [left, top, right, bottom] = detection.bbox.map(|v| v.round() as i32);
        draw_rectangle(&mut image, left, top, right, bottom, color);

        let track = overlay
            .track_ids
            .get(index)
            .copied()
            .flatten()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        let label = format!(
            "{} {} {:.0}%",
            detection.class,
            track,
            detection.confidence * 100.0
        );
        let label_y = (top - 10).max(0);
        let text_width = label.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(&mut image, left, label_y, left + text_width, label_y + 8, SHADE_COLOR);
        draw_label(&mut image, left + 1, label_y + 1, &label, color);
    }

    let banner = format!(
        "IN {}  OUT {}  FPS {:4.1}{}",
        overlay.inbound,
        overlay.outbound,
        overlay.fps,
        if overlay.counting_enabled { "" } else { "  PAUSED" }
    );
    let banner_width = banner.chars().count() as i32 * GLYPH_ADVANCE;
    fill_rect(&mut image, 0, 0, banner_width + 6, 11, SHADE_COLOR);
    draw_label(&mut image, 3, 2, &banner, TEXT_COLOR);

    encode_jpeg(&image, jpeg_quality)
}

/// Encode an RGB image, clamping quality to the supported range.
pub fn encode_jpeg(image: &RgbImage, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let quality = jpeg_quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn class_color(class: ObjectClass) -> Rgb<u8> {
    match class {
        ObjectClass::Truck => Rgb([0, 200, 255]),
        ObjectClass::Person => Rgb([255, 80, 80]),
        ObjectClass::Box => Rgb([0, 255, 0]),
    }
}

fn draw_counting_line(image: &mut RgbImage, line: &CountingLine) {
    let (width, height) = image.dimensions();
    let (w, h) = (width as i32, height as i32);
    let offset = line.pixel_offset((width, height)) as i32;
    let (extent, span) = match line.orientation {
        LineOrientation::Horizontal => (h, w),
        LineOrientation::Vertical => (w, h),
    };
    let band = (line.dead_band * extent as f32).round() as i32;

    for delta in [-band, band] {
        let at = offset + delta;
        // Dashed band edges.
        for step in (0..span).step_by(8) {
            match line.orientation {
                LineOrientation::Horizontal => fill_rect(image, step, at, step + 3, at, BAND_COLOR),
                LineOrientation::Vertical => fill_rect(image, at, step, at, step + 3, BAND_COLOR),
            }
        }
    }
    match line.orientation {
        LineOrientation::Horizontal => {
            fill_rect(image, 0, offset - 1, w - 1, offset + 1, LINE_COLOR)
        }
        LineOrientation::Vertical => {
            fill_rect(image, offset - 1, 0, offset + 1, h - 1, LINE_COLOR)
        }
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    fill_rect(image, left, top, right, top, color);
    fill_rect(image, left, bottom, right, bottom, color);
    fill_rect(image, left, top, left, bottom, color);
    fill_rect(image, right, top, right, bottom, color);
}

fn fill_rect(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// 5x7 bitmap glyphs, one row per byte, most significant of the low five bits on the left.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        '?' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
