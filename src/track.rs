//! Zone transition tracking.
//!
//! Each frame, every person detection is bound to a `TrackId`, its zone is appended to
//! that track's rolling history, and a `ZoneEvent` is emitted when the two most recent
//! entries read `(neutral, entry)` or `(neutral, exit)`.
//!
//! Tracks are not identities. They live only as long as consecutive frames keep
//! matching them; a track missing from the current frame is pruned immediately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::detect::PersonDetection;
use crate::zone::{ZoneClassifier, ZoneKind};
use crate::{CrossingKind, Point, TrackId};

/// Rolling zone history length per track.
pub const MAX_ZONE_HISTORY: usize = 10;

/// Default gate for frame-to-frame centre matching.
pub const DEFAULT_TRACK_MATCH_DISTANCE_PX: f32 = 120.0;

/// How detections are bound to tracks between frames.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TrackAssignment {
    /// Greedy nearest-centre matching against the previous frame, gated by distance.
    NearestCenter { max_distance_px: f32 },
    /// Track id is the detection's position in the detector output.
    ///
    /// Reordering between frames misattributes history; kept for comparison only.
    DetectionOrder,
}

impl Default for TrackAssignment {
    fn default() -> Self {
        Self::NearestCenter {
            max_distance_px: DEFAULT_TRACK_MATCH_DISTANCE_PX,
        }
    }
}

/// Candidate entry/exit produced by a zone transition. Consumed by fusion in the same cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneEvent {
    pub kind: CrossingKind,
    pub track: TrackId,
    pub detection: PersonDetection,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct TrackState {
    history: VecDeque<ZoneKind>,
    last_center: Point,
}

impl TrackState {
    fn new(center: Point) -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_ZONE_HISTORY),
            last_center: center,
        }
    }

    fn record(&mut self, zone: ZoneKind, center: Point) {
        if self.history.len() >= MAX_ZONE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(zone);
        self.last_center = center;
    }

    fn transition(&self) -> Option<CrossingKind> {
        let len = self.history.len();
        if len < 2 {
            return None;
        }
        match (self.history[len - 2], self.history[len - 1]) {
            (ZoneKind::Neutral, ZoneKind::Entry) => Some(CrossingKind::Entry),
            (ZoneKind::Neutral, ZoneKind::Exit) => Some(CrossingKind::Exit),
            _ => None,
        }
    }
}

pub struct ZoneTransitionTracker {
    assignment: TrackAssignment,
    tracks: BTreeMap<TrackId, TrackState>,
    next_track_id: u64,
}

impl ZoneTransitionTracker {
    pub fn new(assignment: TrackAssignment) -> Self {
        Self {
            assignment,
            tracks: BTreeMap::new(),
            next_track_id: 0,
        }
    }

    pub fn assignment(&self) -> TrackAssignment {
        self.assignment
    }

    /// Process one frame of detections and return the zone events it produced.
    pub fn update(
        &mut self,
        detections: &[PersonDetection],
        classifier: &ZoneClassifier,
        width: u32,
        height: u32,
        now: DateTime<Utc>,
    ) -> Vec<ZoneEvent> {
        let assigned = self.assign(detections);
        let mut events = Vec::new();

        for (detection, track) in detections.iter().zip(&assigned) {
            let center = detection.center();
            let zone = classifier.classify(center, width, height);
            let state = self
                .tracks
                .entry(*track)
                .or_insert_with(|| TrackState::new(center));
            state.record(zone, center);

            if let Some(kind) = state.transition() {
                log::debug!("{} crossed into {} zone", track, kind);
                events.push(ZoneEvent {
                    kind,
                    track: *track,
                    detection: detection.clone(),
                    timestamp: now,
                });
            }
        }

        // No grace period: tracks absent from this frame are gone.
        let present: HashSet<TrackId> = assigned.into_iter().collect();
        self.tracks.retain(|id, _| present.contains(id));

        events
    }

    fn assign(&mut self, detections: &[PersonDetection]) -> Vec<TrackId> {
        match self.assignment {
            TrackAssignment::DetectionOrder => {
                (0..detections.len()).map(|i| TrackId(i as u64)).collect()
            }
            TrackAssignment::NearestCenter { max_distance_px } => {
                self.assign_nearest(detections, max_distance_px)
            }
        }
    }

    fn assign_nearest(
        &mut self,
        detections: &[PersonDetection],
        max_distance: f32,
    ) -> Vec<TrackId> {
        let mut pairs: Vec<(f32, usize, TrackId)> = Vec::new();
        for (idx, detection) in detections.iter().enumerate() {
            let center = detection.center();
            for (track, state) in &self.tracks {
                let distance = center.distance(&state.last_center);
                if distance <= max_distance {
                    pairs.push((distance, idx, *track));
                }
            }
        }
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];
        let mut taken: HashSet<TrackId> = HashSet::new();
        for (_, idx, track) in pairs {
            if assigned[idx].is_none() && !taken.contains(&track) {
                assigned[idx] = Some(track);
                taken.insert(track);
            }
        }

        assigned
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let id = TrackId(self.next_track_id);
                    self.next_track_id += 1;
                    id
                })
            })
            .collect()
    }

    /// Zone history of a live track, oldest first.
    pub fn history(&self, track: TrackId) -> Option<Vec<ZoneKind>> {
        self.tracks
            .get(&track)
            .map(|state| state.history.iter().copied().collect())
    }

    pub fn active_tracks(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

impl Default for ZoneTransitionTracker {
    fn default() -> Self {
        Self::new(TrackAssignment::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    const W: u32 = 640;
    const H: u32 = 480;

    fn person_at(x: f32) -> PersonDetection {
        PersonDetection::new(BoundingBox::around(Point::new(x, 240.0), 60.0, 200.0), 0.9)
    }

    fn step(tracker: &mut ZoneTransitionTracker, xs: &[f32]) -> Vec<ZoneEvent> {
        let detections: Vec<_> = xs.iter().map(|x| person_at(*x)).collect();
        tracker.update(&detections, &ZoneClassifier::default(), W, H, Utc::now())
    }

    #[test]
    fn neutral_to_entry_emits_single_event() {
        let mut tracker = ZoneTransitionTracker::default();
        assert!(step(&mut tracker, &[300.0]).is_empty());
        let events = step(&mut tracker, &[200.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrossingKind::Entry);

        // [entry, entry]: no further event.
        assert!(step(&mut tracker, &[190.0]).is_empty());
        assert!(step(&mut tracker, &[150.0]).is_empty());
    }

    #[test]
    fn neutral_to_exit_emits_exit() {
        let mut tracker = ZoneTransitionTracker::default();
        step(&mut tracker, &[350.0]);
        let events = step(&mut tracker, &[430.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrossingKind::Exit);
    }

    #[test]
    fn track_first_seen_inside_zone_emits_nothing() {
        let mut tracker = ZoneTransitionTracker::default();
        assert!(step(&mut tracker, &[100.0]).is_empty());
        assert!(step(&mut tracker, &[110.0]).is_empty());
    }

    #[test]
    fn history_is_capped_fifo() {
        let mut tracker = ZoneTransitionTracker::default();
        for _ in 0..15 {
            step(&mut tracker, &[300.0]);
        }
        let track = tracker.active_tracks()[0];
        let history = tracker.history(track).unwrap();
        assert_eq!(history.len(), MAX_ZONE_HISTORY);
        assert!(history.iter().all(|z| *z == ZoneKind::Neutral));
    }

    #[test]
    fn absent_tracks_are_pruned_immediately() {
        let mut tracker = ZoneTransitionTracker::default();
        step(&mut tracker, &[300.0]);
        step(&mut tracker, &[]);
        assert!(tracker.active_tracks().is_empty());
        // Reappearing inside the entry band starts a fresh history: no event.
        assert!(step(&mut tracker, &[200.0]).is_empty());
    }

    #[test]
    fn nearest_center_survives_detector_reordering() {
        let mut tracker = ZoneTransitionTracker::default();
        step(&mut tracker, &[300.0, 600.0]);
        // Detector swaps output order; A moved neutral -> entry, B stayed in exit.
        let events = step(&mut tracker, &[600.0, 210.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrossingKind::Entry);
        assert_eq!(events[0].detection.center().x, 210.0);
    }

    #[test]
    fn detection_order_misattributes_on_reordering() {
        let mut tracker = ZoneTransitionTracker::new(TrackAssignment::DetectionOrder);
        step(&mut tracker, &[300.0, 600.0]);
        let events = step(&mut tracker, &[600.0, 210.0]);
        // Slot 0 reads (neutral, exit): a phantom exit.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrossingKind::Exit);
        assert_eq!(events[0].track, TrackId(0));
    }

    #[test]
    fn jump_beyond_gate_opens_new_track() {
        let mut tracker = ZoneTransitionTracker::new(TrackAssignment::NearestCenter {
            max_distance_px: 50.0,
        });
        step(&mut tracker, &[300.0]);
        let first = tracker.active_tracks();
        assert!(step(&mut tracker, &[200.0]).is_empty());
        let second = tracker.active_tracks();
        assert_ne!(first, second);
    }
}
