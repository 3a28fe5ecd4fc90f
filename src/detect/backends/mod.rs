pub mod simulated;

pub use simulated::{BoardingScenario, SimulatedFaceEncoder, SimulatedPersonDetector};
