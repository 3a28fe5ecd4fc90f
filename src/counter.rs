//! Counting engine: one synchronous processing cycle.
//!
//! `CountingEngine::process_cycle` runs the core stages strictly in order over one
//! frame's detector outputs:
//!
//! 1. core-side filters (person confidence, minimum face size)
//! 2. zone transition tracker -> candidate zone events
//! 3. identity tracker over the frame's faces
//! 4. fraud-validation fusion -> accepted events
//! 5. trip ledger applies each accepted event, then subscribers are notified
//!
//! A cycle on a closed trip is rejected before stage 1. No stage runs concurrently
//! with another. The engine holds no threads; the pipeline decides when cycles run.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map};

use crate::detect::{FaceDetection, PersonDetection};
use crate::events::{EventBus, PassengerEvent};
use crate::fusion::{AcceptedEvent, FraudValidator, FusionSettings};
use crate::identity::{IdentitySettings, IdentityTracker, IdentityUpdate};
use crate::snapshot::Snapshot;
use crate::track::{TrackAssignment, ZoneTransitionTracker};
use crate::trip::{Trip, TripLedger};
use crate::zone::{default_zones, Zone, ZoneClassifier};

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub device_id: String,
    pub max_capacity: u32,
    /// Person detections below this confidence are ignored.
    pub confidence_threshold: f32,
    pub zones: Vec<Zone>,
    pub track_assignment: TrackAssignment,
    /// When false the engine runs unvalidated: faces are ignored entirely.
    pub face_tracking: bool,
    pub identity: IdentitySettings,
    pub fusion: FusionSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            device_id: "taxi_dev_001".to_string(),
            max_capacity: 14,
            confidence_threshold: 0.5,
            zones: default_zones(),
            track_assignment: TrackAssignment::default(),
            face_tracking: true,
            identity: IdentitySettings::default(),
            fusion: FusionSettings::default(),
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub persons: usize,
    pub faces: usize,
    pub zone_events: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub unvalidated: usize,
    pub passenger_count: u32,
}

pub struct CountingEngine {
    settings: EngineSettings,
    classifier: ZoneClassifier,
    tracker: ZoneTransitionTracker,
    identities: IdentityTracker,
    fusion: FraudValidator,
    ledger: TripLedger,
    bus: EventBus,
}

impl CountingEngine {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let ledger = TripLedger::new(&settings.device_id, settings.max_capacity);
        Self::with_ledger(settings, ledger)
    }

    /// Build an engine writing into an existing ledger handle.
    pub fn with_ledger(settings: EngineSettings, ledger: TripLedger) -> Result<Self> {
        let classifier = ZoneClassifier::new(settings.zones.clone())?;
        Ok(Self {
            classifier,
            tracker: ZoneTransitionTracker::new(settings.track_assignment),
            identities: IdentityTracker::new(settings.identity.clone()),
            fusion: FraudValidator::new(settings.fusion.clone()),
            ledger,
            bus: EventBus::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &TripLedger {
        &self.ledger
    }

    pub fn fusion(&self) -> &FraudValidator {
        &self.fusion
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    /// Run one cycle over a frame's detector outputs.
    ///
    /// `faces` is `None` when the face encoder is absent or failed this frame; the
    /// cycle then runs with an empty identity set and every event is unvalidated.
    pub fn process_cycle(
        &mut self,
        width: u32,
        height: u32,
        persons: Vec<PersonDetection>,
        faces: Option<Vec<FaceDetection>>,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        // A closed trip takes no crossings; leave every stage untouched.
        if !self.ledger.is_open() {
            let trip = self.ledger.trip();
            return Err(anyhow!(
                "trip {} is {}; cycle not applied",
                trip.id(),
                trip.status()
            ));
        }

        let threshold = self.settings.confidence_threshold;
        let persons: Vec<PersonDetection> = persons
            .into_iter()
            .filter(|p| p.confidence >= threshold)
            .collect();

        let faces: Vec<FaceDetection> = match faces {
            Some(faces) if self.settings.face_tracking => faces
                .into_iter()
                .filter(|face| self.identities.admissible(face))
                .collect(),
            _ => Vec::new(),
        };
        let identities = if self.settings.face_tracking {
            self.identities.update(&faces, now)
        } else {
            IdentityUpdate::default()
        };

        let zone_events = self
            .tracker
            .update(&persons, &self.classifier, width, height, now);
        let candidates = zone_events.len();

        let accepted = self.fusion.validate(zone_events, &faces, &identities, now);
        let mut report = CycleReport {
            persons: persons.len(),
            faces: faces.len(),
            zone_events: candidates,
            accepted: accepted.len(),
            rejected: candidates - accepted.len(),
            unvalidated: accepted.iter().filter(|a| !a.is_validated()).count(),
            passenger_count: 0,
        };

        let applied = self.apply_accepted(&accepted, now);
        self.ledger.publish_fusion_stats(self.fusion.stats());
        applied?;

        report.passenger_count = self.ledger.current_count();
        Ok(report)
    }

    fn apply_accepted(&mut self, accepted: &[AcceptedEvent], now: DateTime<Utc>) -> Result<()> {
        for item in accepted {
            let event = &item.event;
            let mut metadata = Map::new();
            metadata.insert("track".into(), json!(event.track.to_string()));
            metadata.insert(
                "identity".into(),
                json!(item.identity.map(|id| id.to_string())),
            );
            metadata.insert("validated".into(), json!(item.is_validated()));
            metadata.insert("confidence".into(), json!(event.detection.confidence));

            let trip_event = self.ledger.record_crossing_at(event.kind, metadata, now)?;

            let notice = PassengerEvent {
                kind: event.kind,
                timestamp: event.timestamp,
                track: event.track,
                identity: item.identity,
                validated: item.is_validated(),
                bbox: event.detection.bbox,
                confidence: event.detection.confidence,
                passenger_count: trip_event.passenger_count,
                trip_event_id: trip_event.event_id,
            };
            self.bus.dispatch(&notice);
        }
        Ok(())
    }

    /// Replace the closed trip with a new one.
    ///
    /// Passengers still aboard carry over: with face tracking the new count is the
    /// number of records inside or in temporary exit, otherwise the closed trip's count.
    pub fn begin_new_trip(&mut self) -> Result<Trip> {
        self.begin_new_trip_at(Utc::now())
    }

    pub fn begin_new_trip_at(&mut self, now: DateTime<Utc>) -> Result<Trip> {
        let aboard = if self.settings.face_tracking {
            u32::try_from(self.fusion.passengers_aboard()).unwrap_or(u32::MAX)
        } else {
            self.ledger.current_count()
        };
        let closed = self.ledger.begin_new_trip_at(aboard, now)?;
        log::info!(
            "trip {} closed; trip {} begun with {} passengers aboard",
            closed.id(),
            self.ledger.trip().id(),
            aboard
        );
        Ok(closed)
    }

    /// End the trip once it has run longer than `timeout` and begin the next one.
    /// Returns the closed trip when a rollover happened.
    pub fn roll_over_if_expired(
        &mut self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Trip>> {
        if !self.ledger.end_if_expired_at(timeout, now)? {
            return Ok(None);
        }
        self.begin_new_trip_at(now).map(Some)
    }

    /// Clear counts, tracks, identities and passenger records.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.identities.reset();
        self.fusion.reset();
        self.ledger.reset_counts();
        log::info!("counting state reset");
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            taken_at: Utc::now(),
            trip: self.ledger.trip(),
            passengers: self.fusion.records(),
            fusion_stats: self.fusion.stats(),
            statistics: self.ledger.statistics(),
            next_identity_id: self.identities.next_id(),
        }
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        let highest_record = snapshot
            .passengers
            .iter()
            .map(|record| record.identity.0 + 1)
            .max()
            .unwrap_or(0);
        self.identities
            .resume_ids_from(snapshot.next_identity_id.max(highest_record));
        log::info!(
            "restored trip {} ({} passengers aboard, {} records)",
            snapshot.trip.id(),
            snapshot.trip.current_passenger_count(),
            snapshot.passengers.len()
        );
        self.fusion.restore(snapshot.passengers, snapshot.fusion_stats);
        self.ledger.restore(snapshot.trip, snapshot.statistics);
    }
}
