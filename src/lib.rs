//! Passenger Counting Kernel
//!
//! This crate implements the fusion and validation engine that turns raw per-frame
//! person/face detections into a trustworthy passenger count for one vehicle.
//!
//! # Architecture
//!
//! One processing cycle runs strictly in this order:
//!
//! 1. **Zone Classifier** (`zone`): detection centre -> entry / exit / neutral.
//! 2. **Zone Transition Tracker** (`track`): per-track zone history -> candidate `ZoneEvent`s.
//! 3. **Identity Tracker** (`identity`): face embeddings -> stable `IdentityId`s.
//! 4. **Fraud-Validation Fusion** (`fusion`): zone events x identities -> accepted events.
//! 5. **Trip Ledger** (`trip`): authoritative count, overload edges, append-only event log.
//!
//! The runtime (`pipeline`) separates frame capture from processing with a bounded
//! drop-oldest `FrameBuffer`. The processing loop is the only writer of the ledger;
//! the presentation layer reads snapshots.
//!
//! Tracks (`TrackId`) and identities (`IdentityId`) are deliberately distinct types.
//! A track is an ephemeral detection slot used for zone history only; an identity is
//! inferred from face embeddings. Fusion bridges the two by spatial proximity per cycle.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`, `detect`: collaborator plumbing (frames, sources, detector traits)
//! - `zone`, `track`, `identity`, `fusion`, `trip`: the counting core
//! - `counter`: one synchronous processing cycle over the core
//! - `events`, `snapshot`, `api`: outward surfaces (subscribers, persistence, read-only HTTP)

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod api;
pub mod config;
pub mod counter;
pub mod detect;
pub mod events;
pub mod frame;
pub mod fusion;
pub mod identity;
pub mod ingest;
pub mod pipeline;
pub mod snapshot;
pub mod track;
pub mod trip;
pub mod zone;

pub use counter::{CountingEngine, CycleReport, EngineSettings};
pub use detect::{FaceDetection, FaceEncoder, PersonDetection, PersonDetector};
pub use events::{EventBus, PassengerEvent};
pub use frame::{Frame, FrameBuffer, DEFAULT_BUFFER_FRAMES};
pub use fusion::{FraudValidator, FusionSettings, FusionStats, PassengerRecord, PassengerStatus};
pub use identity::{IdentitySettings, IdentityStatus, IdentityTracker, TrackedIdentity};
pub use ingest::{FrameSource, SyntheticConfig, SyntheticSource};
pub use pipeline::{CountingPipeline, PipelineHandle, PipelineSettings};
pub use snapshot::Snapshot;
pub use track::{TrackAssignment, ZoneEvent, ZoneTransitionTracker};
pub use trip::{
    CounterStatistics, Trip, TripEvent, TripEventType, TripLedger, TripStatus, TripSummary,
};
pub use zone::{Zone, ZoneClassifier, ZoneKind};

// -------------------- Geometry --------------------

/// A point in native frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned box in native frame pixels, `(x1, y1)` top-left.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Box of the given size centred on `center`.
    pub fn around(center: Point, width: f32, height: f32) -> Self {
        Self::new(
            center.x - width / 2.0,
            center.y - height / 2.0,
            center.x + width / 2.0,
            center.y + height / 2.0,
        )
    }
}

// -------------------- Identifiers --------------------

/// Ephemeral per-frame detection slot used only for zone-crossing history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track_{}", self.0)
    }
}

/// Stable person identity inferred from face-embedding similarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub u64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "face_{:04}", self.0)
    }
}

// -------------------- Crossings --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingKind {
    Entry,
    Exit,
}

impl CrossingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for CrossingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_center_and_size() {
        let bbox = BoundingBox::new(10.0, 20.0, 50.0, 100.0);
        assert_eq!(bbox.center(), Point::new(30.0, 60.0));
        assert_eq!(bbox.width(), 40.0);
        assert_eq!(bbox.height(), 80.0);
    }

    #[test]
    fn identity_ids_render_padded() {
        assert_eq!(IdentityId(7).to_string(), "face_0007");
        assert_eq!(TrackId(3).to_string(), "track_3");
    }

    #[test]
    fn point_distance_is_euclidean() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < f32::EPSILON);
    }
}
