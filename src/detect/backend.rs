use anyhow::Result;

use crate::detect::result::{FaceDetection, PersonDetection};
use crate::frame::Frame;

/// Person detector collaborator.
///
/// Returns person boxes in native frame pixels. Implementations may already apply a
/// confidence threshold; the core applies its own as well.
pub trait PersonDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. An error skips the processing cycle.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<PersonDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Face encoder collaborator.
///
/// Optional: when absent (or failing) the core runs without identity validation.
pub trait FaceEncoder: Send {
    fn name(&self) -> &'static str;

    /// Detect faces and compute one embedding per face.
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
