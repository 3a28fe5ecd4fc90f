//! Identity tracking from face embeddings.
//!
//! Each face embedding is compared to the most recent embedding of every active
//! identity; the closest one within `tolerance` wins, otherwise a new identity is
//! opened. Identities unseen for `max_tracking_time` become `Lost`, and are purged
//! after twice that. Identity ids are never reused for the life of the tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::detect::{embedding_distance, FaceDetection};
use crate::IdentityId;

/// Embeddings retained per identity.
pub const MAX_EMBEDDINGS: usize = 10;

#[derive(Clone, Debug)]
pub struct IdentitySettings {
    /// Maximum embedding distance accepted as the same person.
    pub tolerance: f32,
    /// Silence after which an identity is marked lost (purged after 2x).
    pub max_tracking_time: Duration,
    /// Faces smaller than this in either dimension (pixels) are ignored.
    pub min_face_size: f32,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            tolerance: 0.6,
            max_tracking_time: Duration::from_secs(10),
            min_face_size: 50.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Lost,
}

#[derive(Clone, Debug)]
pub struct TrackedIdentity {
    pub id: IdentityId,
    embeddings: VecDeque<Vec<f32>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub detection_count: u64,
    pub status: IdentityStatus,
}

impl TrackedIdentity {
    fn new(id: IdentityId, embedding: Vec<f32>, now: DateTime<Utc>) -> Self {
        let mut embeddings = VecDeque::with_capacity(MAX_EMBEDDINGS);
        embeddings.push_back(embedding);
        Self {
            id,
            embeddings,
            first_seen: now,
            last_seen: now,
            detection_count: 1,
            status: IdentityStatus::Active,
        }
    }

    fn observe(&mut self, embedding: Vec<f32>, now: DateTime<Utc>) {
        if self.embeddings.len() >= MAX_EMBEDDINGS {
            self.embeddings.pop_front();
        }
        self.embeddings.push_back(embedding);
        self.last_seen = now;
        self.detection_count += 1;
        self.status = IdentityStatus::Active;
    }

    pub fn latest_embedding(&self) -> Option<&[f32]> {
        self.embeddings.back().map(|e| e.as_slice())
    }

    pub fn embedding_count(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_active(&self) -> bool {
        self.status == IdentityStatus::Active
    }
}

/// Result of one tracker update.
#[derive(Clone, Debug, Default)]
pub struct IdentityUpdate {
    /// Identity bound to each input face, in input order.
    pub assignments: Vec<IdentityId>,
    /// Every identity still tracked after aging, active and lost.
    pub identities: Vec<TrackedIdentity>,
}

impl IdentityUpdate {
    pub fn active_ids(&self) -> impl Iterator<Item = IdentityId> + '_ {
        self.identities
            .iter()
            .filter(|identity| identity.is_active())
            .map(|identity| identity.id)
    }
}

pub struct IdentityTracker {
    settings: IdentitySettings,
    identities: BTreeMap<IdentityId, TrackedIdentity>,
    next_id: u64,
}

impl IdentityTracker {
    pub fn new(settings: IdentitySettings) -> Self {
        Self {
            settings,
            identities: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn settings(&self) -> &IdentitySettings {
        &self.settings
    }

    /// Whether a face is large enough to be tracked.
    pub fn admissible(&self, face: &FaceDetection) -> bool {
        face.bbox.width() >= self.settings.min_face_size
            && face.bbox.height() >= self.settings.min_face_size
    }

    /// Match this frame's faces, then age every identity.
    pub fn update(&mut self, faces: &[FaceDetection], now: DateTime<Utc>) -> IdentityUpdate {
        let mut assignments = Vec::with_capacity(faces.len());
        for face in faces {
            let id = match self.best_match(&face.embedding) {
                Some(id) => {
                    if let Some(identity) = self.identities.get_mut(&id) {
                        identity.observe(face.embedding.clone(), now);
                    }
                    id
                }
                None => {
                    let id = IdentityId(self.next_id);
                    self.next_id += 1;
                    log::debug!("new identity {}", id);
                    self.identities
                        .insert(id, TrackedIdentity::new(id, face.embedding.clone(), now));
                    id
                }
            };
            assignments.push(id);
        }

        self.age(now);

        IdentityUpdate {
            assignments,
            identities: self.identities.values().cloned().collect(),
        }
    }

    fn best_match(&self, embedding: &[f32]) -> Option<IdentityId> {
        self.identities
            .values()
            .filter(|identity| identity.is_active())
            .filter_map(|identity| {
                identity
                    .latest_embedding()
                    .map(|latest| (identity.id, embedding_distance(latest, embedding)))
            })
            .filter(|(_, distance)| *distance <= self.settings.tolerance)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    fn age(&mut self, now: DateTime<Utc>) {
        let lost_after = self.settings.max_tracking_time;
        let purge_after = lost_after * 2;
        self.identities.retain(|id, identity| {
            let silent = (now - identity.last_seen).to_std().unwrap_or_default();
            if silent > purge_after {
                log::debug!("identity {} purged after {:?} unseen", id, silent);
                return false;
            }
            if silent > lost_after && identity.is_active() {
                identity.status = IdentityStatus::Lost;
                log::debug!("identity {} marked lost", id);
            }
            true
        });
    }

    pub fn get(&self, id: IdentityId) -> Option<&TrackedIdentity> {
        self.identities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Drop all identities. The id counter keeps counting so ids are never reused.
    pub fn reset(&mut self) {
        self.identities.clear();
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Continue id allocation from a restored snapshot.
    pub fn resume_ids_from(&mut self, next_id: u64) {
        self.next_id = self.next_id.max(next_id);
    }
}

impl Default for IdentityTracker {
    fn default() -> Self {
        Self::new(IdentitySettings::default())
    }
}
