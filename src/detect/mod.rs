//! Detector collaborators.
//!
//! The core never performs inference. It consumes the outputs of two black boxes:
//! a person detector (boxes + confidence) and an optional face encoder
//! (boxes + embeddings). This module defines their traits, their result types and
//! the simulated backends used by the daemon and tests.

mod backend;
pub mod backends;
mod result;

pub use backend::{FaceEncoder, PersonDetector};
pub use backends::{BoardingScenario, SimulatedFaceEncoder, SimulatedPersonDetector};
pub use result::{embedding_distance, FaceDetection, PersonDetection};
