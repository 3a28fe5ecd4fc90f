//! Zone classification.
//!
//! Zones are named, axis-aligned rectangles in normalized `[0, 1]` frame coordinates.
//! Classification is a pure function of the point, the frame size and the static zone
//! list. Entry zones are checked before exit zones so overlapping zones resolve the
//! same way every frame.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::Point;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Entry,
    Exit,
    Neutral,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub kind: ZoneKind,
    /// `[x1, y1, x2, y2]`, normalized to the frame.
    pub rect: [f32; 4],
}

impl Zone {
    pub fn new(name: &str, kind: ZoneKind, rect: [f32; 4]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rect,
        }
    }

    /// Inclusive containment test in pixel space.
    pub fn contains(&self, point: Point, width: u32, height: u32) -> bool {
        let (w, h) = (width as f32, height as f32);
        let [x1, y1, x2, y2] = self.rect;
        point.x >= x1 * w && point.x <= x2 * w && point.y >= y1 * h && point.y <= y2 * h
    }

    fn validate(&self) -> Result<()> {
        validate_zone_name(&self.name)?;
        let [x1, y1, x2, y2] = self.rect;
        if self.rect.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
            return Err(anyhow!(
                "zone {}: coordinates must be finite and within [0, 1]",
                self.name
            ));
        }
        if x1 >= x2 || y1 >= y2 {
            return Err(anyhow!(
                "zone {}: expected x1 < x2 and y1 < y2, got {:?}",
                self.name,
                self.rect
            ));
        }
        Ok(())
    }
}

/// Zone names are short local identifiers: `^[a-z0-9_-]{1,64}$`.
pub fn validate_zone_name(name: &str) -> Result<()> {
    static ZONE_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(name) {
        return Err(anyhow!(
            "zone name '{}' must match ^[a-z0-9_-]{{1,64}}$",
            name
        ));
    }
    Ok(())
}

/// Default layout: entry band on the left, exit band on the right, neutral aisle between.
pub fn default_zones() -> Vec<Zone> {
    vec![
        Zone::new("entry", ZoneKind::Entry, [0.0, 0.0, 0.35, 1.0]),
        Zone::new("exit", ZoneKind::Exit, [0.65, 0.0, 1.0, 1.0]),
    ]
}

/// Validated, immutable zone set in priority order.
#[derive(Clone, Debug)]
pub struct ZoneClassifier {
    ordered: Vec<Zone>,
}

impl ZoneClassifier {
    /// Validate the zone set. Any malformed zone is fatal.
    pub fn new(zones: Vec<Zone>) -> Result<Self> {
        let mut seen = HashSet::new();
        for zone in &zones {
            zone.validate()?;
            if !seen.insert(zone.name.clone()) {
                return Err(anyhow!("duplicate zone name '{}'", zone.name));
            }
        }
        let mut ordered: Vec<Zone> = zones
            .iter()
            .filter(|z| z.kind == ZoneKind::Entry)
            .cloned()
            .collect();
        ordered.extend(zones.into_iter().filter(|z| z.kind == ZoneKind::Exit));
        Ok(Self { ordered })
    }

    /// First entry/exit zone containing the point, in priority order.
    pub fn zone_at(&self, point: Point, width: u32, height: u32) -> Option<&Zone> {
        self.ordered
            .iter()
            .find(|zone| zone.contains(point, width, height))
    }

    pub fn classify(&self, point: Point, width: u32, height: u32) -> ZoneKind {
        self.zone_at(point, width, height)
            .map(|zone| zone.kind)
            .unwrap_or(ZoneKind::Neutral)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.ordered
    }
}

impl Default for ZoneClassifier {
    fn default() -> Self {
        Self {
            ordered: default_zones(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_default_layout() {
        let classifier = ZoneClassifier::default();
        assert_eq!(
            classifier.classify(Point::new(50.0, 240.0), 640, 480),
            ZoneKind::Entry
        );
        assert_eq!(
            classifier.classify(Point::new(320.0, 240.0), 640, 480),
            ZoneKind::Neutral
        );
        assert_eq!(
            classifier.classify(Point::new(600.0, 240.0), 640, 480),
            ZoneKind::Exit
        );
    }

    #[test]
    fn entry_wins_over_overlapping_exit() {
        // Exit listed first; entry still has priority.
        let classifier = ZoneClassifier::new(vec![
            Zone::new("door_out", ZoneKind::Exit, [0.0, 0.0, 0.6, 1.0]),
            Zone::new("door_in", ZoneKind::Entry, [0.4, 0.0, 1.0, 1.0]),
        ])
        .unwrap();
        let point = Point::new(320.0, 100.0);
        assert_eq!(classifier.classify(point, 640, 480), ZoneKind::Entry);
        assert_eq!(classifier.zone_at(point, 640, 480).unwrap().name, "door_in");
    }

    #[test]
    fn declared_neutral_zone_classifies_as_neutral() {
        let classifier = ZoneClassifier::new(vec![Zone::new(
            "aisle",
            ZoneKind::Neutral,
            [0.0, 0.0, 1.0, 1.0],
        )])
        .unwrap();
        assert_eq!(
            classifier.classify(Point::new(10.0, 10.0), 100, 100),
            ZoneKind::Neutral
        );
    }

    #[test]
    fn rejects_malformed_zones() {
        assert!(ZoneClassifier::new(vec![Zone::new(
            "bad",
            ZoneKind::Entry,
            [0.5, 0.0, 0.4, 1.0]
        )])
        .is_err());
        assert!(ZoneClassifier::new(vec![Zone::new(
            "bad",
            ZoneKind::Entry,
            [0.0, 0.0, 1.5, 1.0]
        )])
        .is_err());
        assert!(ZoneClassifier::new(vec![Zone::new(
            "bad",
            ZoneKind::Entry,
            [f32::NAN, 0.0, 0.5, 1.0]
        )])
        .is_err());
        assert!(ZoneClassifier::new(vec![Zone::new(
            "Front Door",
            ZoneKind::Entry,
            [0.0, 0.0, 0.5, 1.0]
        )])
        .is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let zones = vec![
            Zone::new("door", ZoneKind::Entry, [0.0, 0.0, 0.3, 1.0]),
            Zone::new("door", ZoneKind::Exit, [0.7, 0.0, 1.0, 1.0]),
        ];
        assert!(ZoneClassifier::new(zones).is_err());
    }
}
