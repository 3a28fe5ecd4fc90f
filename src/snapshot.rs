//! Snapshot/restore of counting state.
//!
//! The core keeps everything in memory. A `Snapshot` captures the trip, the passenger
//! records and the counters so an external collaborator can persist and resume them.
//!
//! On disk a snapshot is a JSON envelope:
//!
//! ```json
//! { "format": "passenger-kernel/snapshot-v1", "digest": "<sha256 hex>", "state": "<json>" }
//! ```
//!
//! `state` is kept as the exact serialized text so the digest can be checked
//! byte-for-byte. Restore rejects unknown formats and digest mismatches.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::fusion::{FusionStats, PassengerRecord};
use crate::trip::{CounterStatistics, Trip};

pub const SNAPSHOT_FORMAT: &str = "passenger-kernel/snapshot-v1";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub trip: Trip,
    pub passengers: Vec<PassengerRecord>,
    pub fusion_stats: FusionStats,
    pub statistics: CounterStatistics,
    /// Next identity id to allocate, so restored records never collide with new ids.
    pub next_identity_id: u64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: String,
    digest: String,
    state: String,
}

fn state_digest(state: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(state.as_bytes());
    hex::encode(hasher.finalize())
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        let state = serde_json::to_string(self)
            .map_err(|e| anyhow!("serialize snapshot state: {}", e))?;
        let envelope = Envelope {
            format: SNAPSHOT_FORMAT.to_string(),
            digest: state_digest(&state),
            state,
        };
        serde_json::to_string_pretty(&envelope).map_err(|e| anyhow!("serialize snapshot: {}", e))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| anyhow!("parse snapshot envelope: {}", e))?;
        if envelope.format != SNAPSHOT_FORMAT {
            return Err(anyhow!(
                "unsupported snapshot format '{}' (expected {})",
                envelope.format,
                SNAPSHOT_FORMAT
            ));
        }
        let digest = state_digest(&envelope.state);
        if digest != envelope.digest {
            return Err(anyhow!(
                "snapshot digest mismatch: recorded {}, computed {}",
                envelope.digest,
                digest
            ));
        }
        serde_json::from_str(&envelope.state).map_err(|e| anyhow!("parse snapshot state: {}", e))
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let body = self.to_json()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body)
            .map_err(|e| anyhow!("write snapshot {}: {}", tmp.display(), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| anyhow!("move snapshot into {}: {}", path.display(), e))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("read snapshot {}: {}", path.display(), e))?;
        Self::from_json(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CrossingKind;
    use serde_json::Map;

    fn sample() -> Snapshot {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        trip.record_crossing(CrossingKind::Entry, Map::new(), now)
            .unwrap();
        Snapshot {
            taken_at: now,
            trip,
            passengers: Vec::new(),
            fusion_stats: FusionStats {
                prevented_double_counts: 2,
                ..FusionStats::default()
            },
            statistics: CounterStatistics {
                total_entries: 1,
                processing_fps: 4.7,
                ..CounterStatistics::default()
            },
            next_identity_id: 8,
        }
    }

    #[test]
    fn restores_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.snapshot.json");
        let snapshot = sample();
        snapshot.write_to(&path).unwrap();
        let restored = Snapshot::read_from(&path).unwrap();
        assert_eq!(restored.trip.current_passenger_count(), 1);
        assert_eq!(restored.trip.id(), snapshot.trip.id());
        assert_eq!(restored.fusion_stats.prevented_double_counts, 2);
        assert_eq!(restored.next_identity_id, 8);
    }

    #[test]
    fn rejects_tampered_state() {
        let raw = sample().to_json().unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let state = envelope["state"].as_str().unwrap().replace(
            "\"current_passenger_count\":1",
            "\"current_passenger_count\":9",
        );
        envelope["state"] = serde_json::Value::String(state);
        let err = Snapshot::from_json(&envelope.to_string()).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn rejects_unknown_format() {
        let raw = sample().to_json().unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        envelope["format"] = serde_json::Value::String("other/v9".into());
        assert!(Snapshot::from_json(&envelope.to_string()).is_err());
    }
}
