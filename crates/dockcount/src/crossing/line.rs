//! Counting line geometry.

use serde::{Deserialize, Serialize};

use crate::model::Side;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineOrientation {
    /// Line spans the frame width; `Above` is the top half.
    Horizontal,
    /// Line spans the frame height; `Above` is the left half.
    Vertical,
}

/// Virtual line in normalized frame coordinates with a dead band around it.
///
/// Centroids inside the band classify as [`Side::Unknown`] so objects parked on
/// the line do not flip sides on every frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingLine {
    pub orientation: LineOrientation,
    pub position: f32,
    pub dead_band: f32,
}

impl Default for CountingLine {
    fn default() -> Self {
        Self {
            orientation: LineOrientation::Horizontal,
            position: 0.5,
            dead_band: 0.05,
        }
    }
}

impl CountingLine {
    /// Classify a bounding box (`x1, y1, x2, y2` in pixels) against the line.
    pub fn classify(&self, bbox: [f32; 4], frame: (u32, u32)) -> Side {
        let (width, height) = frame;
        if width == 0 || height == 0 {
            return Side::Unknown;
        }
        let normalized = match self.orientation {
            LineOrientation::Horizontal => (bbox[1] + bbox[3]) * 0.5 / height as f32,
            LineOrientation::Vertical => (bbox[0] + bbox[2]) * 0.5 / width as f32,
        };
        if !normalized.is_finite() {
            return Side::Unknown;
        }
        if normalized < self.position - self.dead_band {
            Side::Above
        } else if normalized > self.position + self.dead_band {
            Side::Below
        } else {
            Side::Unknown
        }
    }

    /// Line position in pixels along the axis it splits.
    pub fn pixel_offset(&self, frame: (u32, u32)) -> u32 {
        let extent = match self.orientation {
            LineOrientation::Horizontal => frame.1,
            LineOrientation::Vertical => frame.0,
        };
        (self.position.clamp(0.0, 1.0) * extent as f32).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizontal_line_classifies_by_centroid_y() {
        let line = CountingLine::default();
        let frame = (640, 480);
        assert_eq!(line.classify([0.0, 0.0, 100.0, 100.0], frame), Side::Above);
        assert_eq!(line.classify([0.0, 400.0, 100.0, 480.0], frame), Side::Below);
        assert_eq!(line.classify([0.0, 220.0, 100.0, 260.0], frame), Side::Unknown);
    }

    #[test]
    fn test_vertical_line_uses_centroid_x() {
        let line = CountingLine {
            orientation: LineOrientation::Vertical,
            position: 0.5,
            dead_band: 0.0,
        };
        assert_eq!(line.classify([0.0, 0.0, 10.0, 480.0], (640, 480)), Side::Above);
        assert_eq!(line.classify([600.0, 0.0, 640.0, 10.0], (640, 480)), Side::Below);
    }

    #[test]
    fn test_empty_frame_is_unknown() {
        let line = CountingLine::default();
        assert_eq!(line.classify([0.0, 0.0, 1.0, 1.0], (0, 0)), Side::Unknown);
    }

    #[test]
    fn test_pixel_offset() {
        let line = CountingLine::default();
        assert_eq!(line.pixel_offset((640, 480)), 240);
    }
}
