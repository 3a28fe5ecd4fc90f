//! Frame ingestion sources.
//!
//! A source produces `Frame`s for the capture thread. The counting core only consumes
//! frames; camera lifecycle (decode, reconnect) belongs to the source implementation.
//!
//! - Synthetic `stub://` source (tests, demo, development daemon)
//!
//! Hardware or network sources implement `FrameSource` outside this crate.

pub mod synthetic;

use anyhow::Result;

use crate::frame::Frame;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Frame source collaborator driven by the capture thread.
pub trait FrameSource: Send {
    /// Connect (or reconnect) to the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame. `Ok(None)` means no frame is available right now.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;

    /// Release the underlying stream. Called once when capture stops.
    fn release(&mut self) {}
}
