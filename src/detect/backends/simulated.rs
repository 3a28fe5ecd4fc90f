//! Deterministic simulated detectors.
//!
//! Both detectors derive their output from the frame sequence number only, so a
//! synthetic source plus these backends replays the same boarding pattern on every run:
//! one passenger per period walks from the centre aisle into the entry band, and every
//! `exit_every`-th walker is the previous boarder walking out through the exit band.

use anyhow::Result;

use crate::detect::backend::{FaceEncoder, PersonDetector};
use crate::detect::result::{FaceDetection, PersonDetection};
use crate::frame::Frame;
use crate::{BoundingBox, Point};

const FACE_BOX_PX: f32 = 64.0;

#[derive(Clone, Debug)]
pub struct BoardingScenario {
    pub period_frames: u64,
    pub walk_frames: u64,
    /// Horizontal step per frame as a fraction of frame width.
    pub step_ratio: f32,
    pub exit_every: u64,
    pub embedding_dim: usize,
}

impl Default for BoardingScenario {
    fn default() -> Self {
        Self {
            period_frames: 60,
            walk_frames: 45,
            step_ratio: 0.01,
            exit_every: 4,
            embedding_dim: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Walker {
    center: Point,
    embedding_slot: usize,
}

impl BoardingScenario {
    fn walker_at(&self, sequence: u64, width: u32, height: u32) -> Option<Walker> {
        if self.period_frames == 0 {
            return None;
        }
        let passenger = sequence / self.period_frames;
        let phase = sequence % self.period_frames;
        if phase >= self.walk_frames {
            return None;
        }
        let alighting = self.exit_every > 0
            && passenger > 0
            && passenger % self.exit_every == self.exit_every - 1;
        let direction = if alighting { 1.0 } else { -1.0 };
        let step = width as f32 * self.step_ratio;
        let x = width as f32 / 2.0 + direction * phase as f32 * step;
        let dim = self.embedding_dim.max(1) as u64;
        let slot = if alighting { passenger - 1 } else { passenger };
        Some(Walker {
            center: Point::new(x.clamp(0.0, width as f32), height as f32 / 2.0),
            embedding_slot: (slot % dim) as usize,
        })
    }

    fn embedding(&self, slot: usize) -> Vec<f32> {
        let mut embedding = vec![0.0; self.embedding_dim.max(1)];
        embedding[slot] = 1.0;
        embedding
    }
}

pub struct SimulatedPersonDetector {
    scenario: BoardingScenario,
}

impl SimulatedPersonDetector {
    pub fn new(scenario: BoardingScenario) -> Self {
        Self { scenario }
    }
}

impl PersonDetector for SimulatedPersonDetector {
    fn name(&self) -> &'static str {
        "simulated-person"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<PersonDetection>> {
        let walker = self
            .scenario
            .walker_at(frame.sequence, frame.width, frame.height);
        Ok(walker
            .map(|w| {
                let bbox = BoundingBox::around(
                    w.center,
                    frame.width as f32 * 0.12,
                    frame.height as f32 * 0.6,
                );
                vec![PersonDetection::new(bbox, 0.9)]
            })
            .unwrap_or_default())
    }
}

pub struct SimulatedFaceEncoder {
    scenario: BoardingScenario,
}

impl SimulatedFaceEncoder {
    pub fn new(scenario: BoardingScenario) -> Self {
        Self { scenario }
    }
}

impl FaceEncoder for SimulatedFaceEncoder {
    fn name(&self) -> &'static str {
        "simulated-face"
    }

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>> {
        let walker = self
            .scenario
            .walker_at(frame.sequence, frame.width, frame.height);
        Ok(walker
            .map(|w| {
                let face_center = Point::new(w.center.x, w.center.y - 60.0);
                vec![FaceDetection::new(
                    BoundingBox::around(face_center, FACE_BOX_PX, FACE_BOX_PX),
                    self.scenario.embedding(w.embedding_slot),
                )]
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> Frame {
        Frame::new(Vec::new(), 640, 480, sequence)
    }

    #[test]
    fn boarder_walks_towards_entry_band() {
        let mut detector = SimulatedPersonDetector::new(BoardingScenario::default());
        let start = detector.detect(&frame(0)).unwrap();
        let later = detector.detect(&frame(30)).unwrap();
        assert_eq!(start.len(), 1);
        assert!(later[0].center().x < start[0].center().x);
        assert!(detector.detect(&frame(50)).unwrap().is_empty());
    }

    #[test]
    fn alighting_walker_reuses_previous_boarder_face() {
        let scenario = BoardingScenario::default();
        let mut encoder = SimulatedFaceEncoder::new(scenario.clone());
        let boarder = encoder.detect_faces(&frame(2 * 60)).unwrap();
        let alighter = encoder.detect_faces(&frame(3 * 60 + 5)).unwrap();
        assert_eq!(boarder[0].embedding, alighter[0].embedding);

        let mut detector = SimulatedPersonDetector::new(scenario);
        let walking_out = detector.detect(&frame(3 * 60 + 30)).unwrap();
        assert!(walking_out[0].center().x > 320.0);
    }
}
