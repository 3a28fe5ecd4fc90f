//! Capture and processing runtime.
//!
//! Two threads, one bounded buffer:
//! - capture: `FrameSource::next_frame` -> `FrameBuffer::push` (drop-oldest, never blocks)
//! - processing: `FrameBuffer::get_frame(timeout)`, every Nth frame runs detectors and
//!   one `CountingEngine` cycle while holding the engine lock
//!
//! The processing thread is the only writer of the ledger. `PipelineHandle` exposes
//! read access for the presentation layer and stops both threads cleanly: the capture
//! thread releases its source, the processing thread finishes any in-flight cycle,
//! and the ledger stays queryable afterwards.

use anyhow::{anyhow, Result};
use chrono::Utc;
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::counter::CountingEngine;
use crate::detect::{FaceEncoder, PersonDetector};
use crate::events::PassengerEvent;
use crate::frame::{FrameBuffer, DEFAULT_BUFFER_FRAMES};
use crate::ingest::FrameSource;
use crate::snapshot::Snapshot;
use crate::trip::{CounterStatistics, TripLedger};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const IDLE_POLL: Duration = Duration::from_millis(10);
const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub buffer_capacity: usize,
    /// Run a cycle on every Nth dequeued frame.
    pub process_every_n_frames: u64,
    pub frame_timeout: Duration,
    /// Active trips older than this are ended and a new trip begins.
    pub trip_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_FRAMES,
            process_every_n_frames: 3,
            frame_timeout: Duration::from_millis(1000),
            trip_timeout: Duration::from_secs(120 * 60),
        }
    }
}

pub struct CountingPipeline {
    settings: PipelineSettings,
    engine: CountingEngine,
    source: Box<dyn FrameSource>,
    detector: Box<dyn PersonDetector>,
    encoder: Option<Box<dyn FaceEncoder>>,
}

impl CountingPipeline {
    pub fn new(
        settings: PipelineSettings,
        engine: CountingEngine,
        source: Box<dyn FrameSource>,
        detector: Box<dyn PersonDetector>,
        encoder: Option<Box<dyn FaceEncoder>>,
    ) -> Self {
        Self {
            settings,
            engine,
            source,
            detector,
            encoder,
        }
    }

    /// Spawn the capture and processing threads.
    pub fn start(self) -> Result<PipelineHandle> {
        let CountingPipeline {
            settings,
            engine,
            source,
            mut detector,
            mut encoder,
        } = self;

        if settings.process_every_n_frames == 0 {
            return Err(anyhow!("process_every_n_frames must be >= 1"));
        }
        detector
            .warm_up()
            .map_err(|e| anyhow!("person detector {} failed to warm up: {}", detector.name(), e))?;
        if let Some(enc) = encoder.as_mut() {
            if let Err(e) = enc.warm_up() {
                log::warn!(
                    "face encoder {} unavailable ({}); counting unvalidated",
                    enc.name(),
                    e
                );
                encoder = None;
            }
        }

        let ledger = engine.ledger().clone();
        let engine = Arc::new(Mutex::new(engine));
        let buffer = Arc::new(FrameBuffer::with_capacity(settings.buffer_capacity));
        let shutdown = Arc::new(AtomicBool::new(false));

        let capture = {
            let buffer = buffer.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || run_capture(source, buffer, shutdown))
                .map_err(|e| anyhow!("spawn capture thread: {}", e))?
        };

        let processing = {
            let worker = ProcessingLoop {
                settings: settings.clone(),
                engine: engine.clone(),
                ledger: ledger.clone(),
                buffer: buffer.clone(),
                shutdown: shutdown.clone(),
                detector,
                encoder,
            };
            let spawned = std::thread::Builder::new()
                .name("processing".into())
                .spawn(move || worker.run());
            match spawned {
                Ok(join) => join,
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    buffer.close();
                    let _ = capture.join();
                    return Err(anyhow!("spawn processing thread: {}", e));
                }
            }
        };

        log::info!(
            "counting pipeline started (buffer {} frames, every {} frames)",
            settings.buffer_capacity,
            settings.process_every_n_frames
        );

        Ok(PipelineHandle {
            engine,
            ledger,
            buffer,
            shutdown,
            capture: Some(capture),
            processing: Some(processing),
        })
    }
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

fn run_capture(
    mut source: Box<dyn FrameSource>,
    buffer: Arc<FrameBuffer>,
    shutdown: Arc<AtomicBool>,
) {
    let mut connected = false;
    while !shutdown.load(Ordering::SeqCst) {
        if !connected {
            match source.connect() {
                Ok(()) => connected = true,
                Err(e) => {
                    log::warn!("frame source connect failed: {}", e);
                    sleep_unless_shutdown(&shutdown, RECONNECT_DELAY);
                    continue;
                }
            }
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                buffer.push(frame);
            }
            Ok(None) => std::thread::sleep(IDLE_POLL),
            Err(e) => {
                log::warn!("frame capture failed: {}; reconnecting", e);
                connected = false;
                sleep_unless_shutdown(&shutdown, RECONNECT_DELAY);
            }
        }
    }
    source.release();
    log::info!("capture stopped after {} frames", source.stats().frames_captured);
}

fn sleep_unless_shutdown(shutdown: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(IDLE_POLL);
    }
}

// ----------------------------------------------------------------------------
// Processing thread
// ----------------------------------------------------------------------------

struct ProcessingLoop {
    settings: PipelineSettings,
    engine: Arc<Mutex<CountingEngine>>,
    ledger: TripLedger,
    buffer: Arc<FrameBuffer>,
    shutdown: Arc<AtomicBool>,
    detector: Box<dyn PersonDetector>,
    encoder: Option<Box<dyn FaceEncoder>>,
}

impl ProcessingLoop {
    fn run(mut self) {
        let mut dequeued = 0u64;
        let mut window_start = Instant::now();
        let mut window_cycles = 0u32;

        while !self.shutdown.load(Ordering::SeqCst) {
            self.ledger
                .set_frame_counters(self.buffer.pushed(), self.buffer.dropped());

            let elapsed = window_start.elapsed();
            if elapsed >= FPS_WINDOW {
                self.ledger
                    .set_processing_fps(f64::from(window_cycles) / elapsed.as_secs_f64());
                window_start = Instant::now();
                window_cycles = 0;
            }

            self.check_trip_timeout();

            let Some(frame) = self.buffer.get_frame(self.settings.frame_timeout) else {
                continue;
            };
            dequeued += 1;
            if dequeued % self.settings.process_every_n_frames != 0 {
                continue;
            }

            let persons = match self.detector.detect(&frame) {
                Ok(persons) => persons,
                Err(e) => {
                    log::warn!("person detector failed on frame {}: {}", frame.sequence, e);
                    self.ledger.record_cycle(false);
                    continue;
                }
            };
            let faces = match self.encoder.as_mut() {
                Some(encoder) => match encoder.detect_faces(&frame) {
                    Ok(faces) => Some(faces),
                    Err(e) => {
                        log::warn!("face encoder failed on frame {}: {}", frame.sequence, e);
                        None
                    }
                },
                None => None,
            };

            let outcome = match self.engine.lock() {
                Ok(mut engine) => {
                    engine.process_cycle(frame.width, frame.height, persons, faces, Utc::now())
                }
                Err(_) => {
                    log::error!("counting engine lock poisoned; processing stopped");
                    break;
                }
            };
            match outcome {
                Ok(report) => {
                    window_cycles += 1;
                    self.ledger.record_cycle(true);
                    if report.zone_events > 0 {
                        log::debug!(
                            "frame {}: {} zone events, {} accepted, count {}",
                            frame.sequence,
                            report.zone_events,
                            report.accepted,
                            report.passenger_count
                        );
                    }
                }
                Err(e) => {
                    log::warn!("processing cycle failed on frame {}: {}", frame.sequence, e);
                    self.ledger.record_cycle(false);
                }
            }
        }
        self.ledger
            .set_frame_counters(self.buffer.pushed(), self.buffer.dropped());
        log::info!("processing stopped after {} frames", dequeued);
    }

    fn check_trip_timeout(&self) {
        let Ok(mut engine) = self.engine.lock() else {
            log::error!("counting engine lock poisoned; trip timeout not checked");
            return;
        };
        match engine.roll_over_if_expired(self.settings.trip_timeout, Utc::now()) {
            Ok(Some(closed)) => log::info!("trip {} closed on timeout", closed.id()),
            Ok(None) => {}
            Err(e) => log::warn!("trip timeout check failed: {}", e),
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

pub struct PipelineHandle {
    engine: Arc<Mutex<CountingEngine>>,
    ledger: TripLedger,
    buffer: Arc<FrameBuffer>,
    shutdown: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    processing: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    fn engine(&self) -> Result<MutexGuard<'_, CountingEngine>> {
        self.engine
            .lock()
            .map_err(|_| anyhow!("counting engine lock poisoned"))
    }

    pub fn get_current_count(&self) -> u32 {
        self.ledger.current_count()
    }

    pub fn get_statistics(&self) -> CounterStatistics {
        self.ledger.statistics()
    }

    /// Read handle on the ledger; stays valid after `stop()`.
    pub fn ledger(&self) -> TripLedger {
        self.ledger.clone()
    }

    pub fn add_event_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&PassengerEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.engine()?.events_mut().add_callback(callback);
        Ok(())
    }

    pub fn subscribe(&self, capacity: usize) -> Result<Receiver<PassengerEvent>> {
        Ok(self.engine()?.events_mut().subscribe(capacity))
    }

    /// Clear counts, identities and passenger records between cycles.
    pub fn reset(&self) -> Result<()> {
        self.engine()?.reset();
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.engine()?.snapshot())
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_running(&self) -> bool {
        self.processing.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop both threads and wait for them. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        if self.capture.is_none() && self.processing.is_none() {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.buffer.close();
        let mut panicked = Vec::new();
        if let Some(join) = self.capture.take() {
            if join.join().is_err() {
                panicked.push("capture");
            }
        }
        if let Some(join) = self.processing.take() {
            if join.join().is_err() {
                panicked.push("processing");
            }
        }
        if !panicked.is_empty() {
            return Err(anyhow!("pipeline thread(s) panicked: {}", panicked.join(", ")));
        }
        log::info!("counting pipeline stopped");
        Ok(())
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("pipeline shutdown: {}", e);
        }
    }
}
