//! Synthetic frame source (`stub://` URLs).
//!
//! Produces patterned frames paced at the configured frame rate. Paired with the
//! simulated detectors it drives the whole pipeline without a camera.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Must start with `stub://`.
    pub url: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Stop producing after this many frames (`None` = endless).
    pub max_frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://cabin_camera".to_string(),
            target_fps: 15,
            width: 640,
            height: 480,
            max_frames: None,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    connected: bool,
    next_due: Option<Instant>,
    /// Simulated "scene" state so consecutive frames differ.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if !config.url.starts_with("stub://") {
            return Err(anyhow!(
                "synthetic source only supports stub:// urls, got {}",
                config.url
            ));
        }
        if config.target_fps == 0 {
            return Err(anyhow!("synthetic source target_fps must be >= 1"));
        }
        Ok(Self {
            config,
            frame_count: 0,
            connected: false,
            next_due: None,
            scene_state: 0,
        })
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.target_fps as f64)
    }

    fn exhausted(&self) -> bool {
        self.config
            .max_frames
            .is_some_and(|max| self.frame_count >= max)
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize; // RGB
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, p) in pixels.iter_mut().enumerate() {
            *p = ((i as u8).wrapping_mul(7)).wrapping_add(self.scene_state);
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} not connected", self.config.url));
        }
        if self.exhausted() {
            return Ok(None);
        }

        // Pace to the target frame rate.
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.frame_interval());

        let sequence = self.frame_count;
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Ok(Some(Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            sequence,
        )))
    }

    fn is_healthy(&self) -> bool {
        self.connected && !self.exhausted()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: released {}", self.config.url);
        }
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_frames: Option<u64>) -> SyntheticConfig {
        SyntheticConfig {
            target_fps: 1000,
            width: 8,
            height: 8,
            max_frames,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn rejects_non_stub_urls() {
        let config = SyntheticConfig {
            url: "rtsp://10.0.0.2/stream".to_string(),
            ..SyntheticConfig::default()
        };
        assert!(SyntheticSource::new(config).is_err());
    }

    #[test]
    fn requires_connect_before_capture() {
        let mut source = SyntheticSource::new(fast_config(None)).unwrap();
        assert!(source.next_frame().is_err());
        source.connect().unwrap();
        assert!(source.next_frame().unwrap().is_some());
    }

    #[test]
    fn produces_sequenced_frames_until_exhausted() {
        let mut source = SyntheticSource::new(fast_config(Some(3))).unwrap();
        source.connect().unwrap();
        let seqs: Vec<u64> = (0..3)
            .map(|_| source.next_frame().unwrap().unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(source.next_frame().unwrap().is_none());
        assert!(!source.is_healthy());
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[test]
    fn frames_carry_configured_dimensions() {
        let mut source = SyntheticSource::new(fast_config(None)).unwrap();
        source.connect().unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (8, 8));
        assert_eq!(frame.pixels().len(), 8 * 8 * 3);
    }
}
