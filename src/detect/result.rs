use serde::{Deserialize, Serialize};

use crate::{BoundingBox, Point};

/// One person box from the detector, in native frame pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl PersonDetection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }

    pub fn center(&self) -> Point {
        self.bbox.center()
    }
}

/// One face box plus its embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

impl FaceDetection {
    pub fn new(bbox: BoundingBox, embedding: Vec<f32>) -> Self {
        Self { bbox, embedding }
    }

    pub fn center(&self) -> Point {
        self.bbox.center()
    }
}

/// Euclidean distance between two embeddings. Embeddings of different lengths never match.
pub fn embedding_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_distance_matches_euclidean() {
        let d = embedding_distance(&[0.0, 0.0, 1.0], &[0.0, 1.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_embeddings_never_match() {
        assert!(embedding_distance(&[0.0, 1.0], &[0.0]).is_infinite());
    }
}
