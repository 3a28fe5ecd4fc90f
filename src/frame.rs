//! Frames and the capture-side frame buffer.
//!
//! - `Frame`: one decoded image plus capture metadata. Owned by one processing cycle.
//! - `FrameBuffer`: bounded queue between the capture thread and the processing loop.
//!
//! The buffer never blocks the producer. When full, the oldest frame is evicted so the
//! consumer always sees a recent frame; missed frames are tolerable, stalled capture is not.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default frame buffer capacity.
pub const DEFAULT_BUFFER_FRAMES: usize = 10;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-source sequence number.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Utc::now(),
        }
    }

    /// Raw pixel bytes for detector collaborators.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded, drop-oldest
// ----------------------------------------------------------------------------

struct BufferState {
    frames: VecDeque<Frame>,
    closed: bool,
    pushed: u64,
    dropped: u64,
}

pub struct FrameBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
    max_frames: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_FRAMES)
    }

    pub fn with_capacity(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(max_frames),
                closed: false,
                pushed: 0,
                dropped: 0,
            }),
            ready: Condvar::new(),
            max_frames,
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a frame. Returns true when the oldest frame was evicted to make room.
    pub fn push(&self, frame: Frame) -> bool {
        let mut state = self.state();
        let mut evicted = false;
        while state.frames.len() >= self.max_frames {
            state.frames.pop_front();
            state.dropped += 1;
            evicted = true;
        }
        state.frames.push_back(frame);
        state.pushed += 1;
        drop(state);
        self.ready.notify_one();
        evicted
    }

    /// Take the oldest buffered frame, waiting up to `timeout`.
    ///
    /// Expiry (or a closed, empty buffer) yields `None`: "no frame this tick".
    pub fn get_frame(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Wake all waiters and discard buffered frames.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.frames.clear();
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    /// Frames accepted since creation.
    pub fn pushed(&self) -> u64 {
        self.state().pushed
    }

    /// Frames evicted by drop-oldest since creation.
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.state().frames.iter().map(|f| f.byte_len()).sum()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_test_frame(sequence: u64) -> Frame {
        Frame::new(vec![0u8; 12], 2, 2, sequence)
    }

    #[test]
    fn drops_oldest_when_full() {
        let buf = FrameBuffer::with_capacity(3);
        for seq in 0..5 {
            buf.push(make_test_frame(seq));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.dropped(), 2);
        assert_eq!(buf.pushed(), 5);

        let first = buf.get_frame(Duration::from_millis(1)).unwrap();
        assert_eq!(first.sequence, 2);
    }

    #[test]
    fn push_reports_eviction() {
        let buf = FrameBuffer::with_capacity(1);
        assert!(!buf.push(make_test_frame(0)));
        assert!(buf.push(make_test_frame(1)));
    }

    #[test]
    fn get_frame_times_out_without_error() {
        let buf = FrameBuffer::new();
        let start = Instant::now();
        assert!(buf.get_frame(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_wakes_waiting_consumer() {
        let buf = Arc::new(FrameBuffer::new());
        let waiter = {
            let buf = buf.clone();
            std::thread::spawn(move || buf.get_frame(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        buf.close();
        assert!(waiter.join().unwrap().is_none());
        assert!(buf.is_closed());
    }

    #[test]
    fn producer_on_other_thread_delivers_frame() {
        let buf = Arc::new(FrameBuffer::new());
        let producer = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                buf.push(make_test_frame(42));
            })
        };
        let frame = buf.get_frame(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.sequence, 42);
        producer.join().unwrap();
    }
}
