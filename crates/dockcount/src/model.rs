//! Domain types passed between capture, counting and dispatch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object classes the detector reports for the dock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Truck,
    Person,
    Box,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 3] = [ObjectClass::Truck, ObjectClass::Person, ObjectClass::Box];

    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Truck => "truck",
            ObjectClass::Person => "person",
            ObjectClass::Box => "box",
        }
    }

    /// Map a detector label onto a dock class. Unknown labels are ignored.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "truck" | "lorry" => Some(ObjectClass::Truck),
            "person" | "people" => Some(ObjectClass::Person),
            "box" | "boxes" | "carton" | "package" => Some(ObjectClass::Box),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single detector hit for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: ObjectClass,
    /// `x1, y1, x2, y2` in frame pixels.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub timestamp_ms: i64,
}

impl Detection {
    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) * 0.5,
            (self.bbox[1] + self.bbox[3]) * 0.5,
        )
    }

    /// Boxes with non-finite or inverted corners cannot be associated.
    pub fn is_well_formed(&self) -> bool {
        self.bbox.iter().all(|v| v.is_finite())
            && self.bbox[2] > self.bbox[0]
            && self.bbox[3] > self.bbox[1]
    }
}

/// Stable identity assigned by the association stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the counting line a track was last seen on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Above,
    Below,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Correlated data attached to an event when it is confirmed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Plate text supplied by a controller for the truck at the dock.
    pub plate: Option<String>,
    /// Inbound total including this event.
    pub inbound_total: u64,
    /// Outbound total including this event.
    pub outbound_total: u64,
}

/// A confirmed directional crossing. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CountEvent {
    pub id: u64,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub track_id: TrackId,
    pub class: ObjectClass,
    pub metadata: EventMetadata,
}
