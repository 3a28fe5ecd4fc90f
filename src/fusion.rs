//! Fraud-validation fusion.
//!
//! This module is responsible for:
//! - Bridging zone events (track-based) to identities (face-based) by spatial proximity
//! - Rejecting double counts via per-identity passenger records
//! - Silence-based temporary exits and retention cleanup
//!
//! This module MUST NOT:
//! - Drop an event just because no face matched it (those pass through unvalidated)
//! - Mutate identities (they belong to the identity tracker)
//! - Touch the trip count (the ledger applies accepted events)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use crate::detect::FaceDetection;
use crate::identity::IdentityUpdate;
use crate::track::ZoneEvent;
use crate::{CrossingKind, IdentityId};

#[derive(Clone, Debug)]
pub struct FusionSettings {
    /// Maximum face-to-person centre distance, in native frame pixels.
    pub match_distance_px: f32,
    /// Inside passengers unseen this long after entry become temporary exits.
    pub temporary_exit_timeout: Duration,
    /// Records with no entry/exit for this long are purged.
    pub record_retention: Duration,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            match_distance_px: 100.0,
            temporary_exit_timeout: Duration::from_secs(30),
            record_retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassengerStatus {
    Inside,
    Outside,
    TemporaryExit,
}

impl PassengerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inside => "inside",
            Self::Outside => "outside",
            Self::TemporaryExit => "temporary_exit",
        }
    }

    /// Inside or presumed inside.
    pub fn is_aboard(&self) -> bool {
        matches!(self, Self::Inside | Self::TemporaryExit)
    }
}

impl fmt::Display for PassengerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassengerRecord {
    pub identity: IdentityId,
    pub status: PassengerStatus,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    /// `"<entry|exit>_<rfc3339>"`, oldest first.
    pub events: Vec<String>,
}

impl PassengerRecord {
    fn first_sighting(identity: IdentityId, kind: CrossingKind, now: DateTime<Utc>) -> Self {
        let (status, entry_time, exit_time) = match kind {
            CrossingKind::Entry => (PassengerStatus::Inside, Some(now), None),
            CrossingKind::Exit => (PassengerStatus::Outside, None, Some(now)),
        };
        Self {
            identity,
            status,
            entry_time,
            exit_time,
            events: Vec::new(),
        }
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        match (self.entry_time, self.exit_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn allows(&self, kind: CrossingKind) -> bool {
        match kind {
            CrossingKind::Entry => matches!(
                self.status,
                PassengerStatus::Outside | PassengerStatus::TemporaryExit
            ),
            CrossingKind::Exit => self.status == PassengerStatus::Inside,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionStats {
    pub prevented_double_counts: u64,
    pub temporary_exits_handled: u64,
    pub unique_passengers_seen: u64,
    pub unvalidated_events: u64,
}

/// A zone event that survived validation.
#[derive(Clone, Debug, PartialEq)]
pub struct AcceptedEvent {
    pub event: ZoneEvent,
    /// Matched identity. `None` means the event passed through unvalidated.
    pub identity: Option<IdentityId>,
}

impl AcceptedEvent {
    pub fn is_validated(&self) -> bool {
        self.identity.is_some()
    }
}

pub struct FraudValidator {
    settings: FusionSettings,
    records: BTreeMap<IdentityId, PassengerRecord>,
    stats: FusionStats,
}

impl FraudValidator {
    pub fn new(settings: FusionSettings) -> Self {
        Self {
            settings,
            records: BTreeMap::new(),
            stats: FusionStats::default(),
        }
    }

    /// Validate one cycle's zone events.
    ///
    /// `faces` and `identities.assignments` are parallel: face `i` belongs to
    /// `assignments[i]`. With no faces, every event passes through unvalidated.
    pub fn validate(
        &mut self,
        events: Vec<ZoneEvent>,
        faces: &[FaceDetection],
        identities: &IdentityUpdate,
        now: DateTime<Utc>,
    ) -> Vec<AcceptedEvent> {
        let mut accepted = Vec::with_capacity(events.len());

        for event in events {
            let Some(identity) = self.match_identity(&event, faces, identities) else {
                self.stats.unvalidated_events += 1;
                log::warn!(
                    "{} event from {} has no matching face; counting unvalidated",
                    event.kind,
                    event.track
                );
                accepted.push(AcceptedEvent {
                    event,
                    identity: None,
                });
                continue;
            };

            if let Some(record) = self.records.get(&identity) {
                if !record.allows(event.kind) {
                    self.stats.prevented_double_counts += 1;
                    log::warn!(
                        "rejected {} for {} (status {}): double count prevented",
                        event.kind,
                        identity,
                        record.status
                    );
                    continue;
                }
            }

            self.apply(identity, event.kind, now);
            log::info!("validated {} for {}", event.kind, identity);
            accepted.push(AcceptedEvent {
                event,
                identity: Some(identity),
            });
        }

        let active: HashSet<IdentityId> = identities.active_ids().collect();
        self.mark_temporary_exits(&active, now);
        self.cleanup(now);

        accepted
    }

    fn match_identity(
        &self,
        event: &ZoneEvent,
        faces: &[FaceDetection],
        identities: &IdentityUpdate,
    ) -> Option<IdentityId> {
        let center = event.detection.center();
        faces
            .iter()
            .zip(&identities.assignments)
            .map(|(face, id)| (face.center().distance(&center), *id))
            .filter(|(distance, _)| *distance <= self.settings.match_distance_px)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, id)| id)
    }

    fn apply(&mut self, identity: IdentityId, kind: CrossingKind, now: DateTime<Utc>) {
        let record = match self.records.entry(identity) {
            Entry::Vacant(slot) => {
                self.stats.unique_passengers_seen += 1;
                slot.insert(PassengerRecord::first_sighting(identity, kind, now))
            }
            Entry::Occupied(slot) => {
                let record = slot.into_mut();
                match kind {
                    CrossingKind::Entry => {
                        if record.status == PassengerStatus::TemporaryExit {
                            self.stats.temporary_exits_handled += 1;
                            log::info!("handled temporary exit for {}", identity);
                        }
                        record.status = PassengerStatus::Inside;
                        record.entry_time = Some(now);
                    }
                    CrossingKind::Exit => {
                        record.status = PassengerStatus::Outside;
                        record.exit_time = Some(now);
                    }
                }
                record
            }
        };
        record
            .events
            .push(format!("{}_{}", kind.as_str(), now.to_rfc3339()));
    }

    fn mark_temporary_exits(&mut self, active: &HashSet<IdentityId>, now: DateTime<Utc>) {
        let timeout = self.settings.temporary_exit_timeout;
        for record in self.records.values_mut() {
            if record.status != PassengerStatus::Inside || active.contains(&record.identity) {
                continue;
            }
            let Some(entered) = record.entry_time else {
                continue;
            };
            let elapsed = (now - entered).to_std().unwrap_or_default();
            if elapsed > timeout {
                record.status = PassengerStatus::TemporaryExit;
                log::info!(
                    "{} unseen {}s after entry; marked temporary exit",
                    record.identity,
                    elapsed.as_secs()
                );
            }
        }
    }

    fn cleanup(&mut self, now: DateTime<Utc>) {
        let retention = self.settings.record_retention;
        self.records.retain(|_, record| match record.last_activity() {
            Some(at) => (now - at).to_std().unwrap_or_default() <= retention,
            None => true,
        });
    }

    pub fn record(&self, identity: IdentityId) -> Option<&PassengerRecord> {
        self.records.get(&identity)
    }

    pub fn records(&self) -> Vec<PassengerRecord> {
        self.records.values().cloned().collect()
    }

    /// Records currently inside or in temporary exit.
    pub fn passengers_aboard(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.status.is_aboard())
            .count()
    }

    pub fn stats(&self) -> FusionStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.stats = FusionStats::default();
    }

    /// Replace records and counters with restored state.
    pub fn restore(&mut self, records: Vec<PassengerRecord>, stats: FusionStats) {
        self.records = records
            .into_iter()
            .map(|record| (record.identity, record))
            .collect();
        self.stats = stats;
    }
}

impl Default for FraudValidator {
    fn default() -> Self {
        Self::new(FusionSettings::default())
    }
}
