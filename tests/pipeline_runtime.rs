use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use passenger_kernel::detect::{BoardingScenario, SimulatedFaceEncoder, SimulatedPersonDetector};
use passenger_kernel::{
    CountingEngine, CountingPipeline, CrossingKind, EngineSettings, FaceDetection, FaceEncoder,
    Frame, PersonDetection, PersonDetector, PipelineHandle, PipelineSettings, SyntheticConfig,
    SyntheticSource,
};

fn fast_source() -> Box<SyntheticSource> {
    Box::new(
        SyntheticSource::new(SyntheticConfig {
            url: "stub://test_cabin".to_string(),
            target_fps: 200,
            width: 640,
            height: 480,
            max_frames: None,
        })
        .expect("synthetic source"),
    )
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        process_every_n_frames: 1,
        frame_timeout: Duration::from_millis(50),
        ..PipelineSettings::default()
    }
}

fn start(encoder: Option<Box<dyn FaceEncoder>>) -> PipelineHandle {
    let engine = CountingEngine::new(EngineSettings::default()).expect("engine");
    CountingPipeline::new(
        settings(),
        engine,
        fast_source(),
        Box::new(SimulatedPersonDetector::new(BoardingScenario::default())),
        encoder,
    )
    .start()
    .expect("pipeline start")
}

fn wait_for<F: Fn(&PipelineHandle) -> bool>(handle: &PipelineHandle, cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond(handle) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

struct BrokenDetector;

impl PersonDetector for BrokenDetector {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<PersonDetection>> {
        Err(anyhow!("no model"))
    }

    fn warm_up(&mut self) -> Result<()> {
        Err(anyhow!("model file missing"))
    }
}

struct BrokenEncoder;

impl FaceEncoder for BrokenEncoder {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<FaceDetection>> {
        Err(anyhow!("no model"))
    }

    fn warm_up(&mut self) -> Result<()> {
        Err(anyhow!("model file missing"))
    }
}

#[test]
fn counts_validated_boarding_from_synthetic_source() {
    let scenario = BoardingScenario::default();
    let mut handle = start(Some(Box::new(SimulatedFaceEncoder::new(scenario))));
    let events = handle.subscribe(16).expect("subscribe");

    assert!(
        wait_for(&handle, |h| h.get_current_count() >= 1),
        "no passenger counted"
    );
    let event = events
        .recv_timeout(Duration::from_secs(5))
        .expect("passenger event");
    assert_eq!(event.kind, CrossingKind::Entry);
    assert!(event.validated);
    assert!(event.identity.is_some());

    handle.stop().expect("stop");
    let stats = handle.get_statistics();
    assert!(stats.total_entries >= 1);
    assert!(stats.frames_captured > 0);
    assert!(stats.cycles_processed > 0);
    assert!(stats.unique_passengers_seen >= 1);
}

#[test]
fn ledger_stays_queryable_after_stop() {
    let mut handle = start(None);
    assert!(wait_for(&handle, |h| h.get_current_count() >= 1));

    handle.stop().expect("stop");
    assert!(!handle.is_running());
    // Second stop is a no-op.
    handle.stop().expect("second stop");

    let ledger = handle.ledger();
    let count = ledger.current_count();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ledger.current_count(), count);
    assert!(!ledger.recent_events(10).is_empty());

    let snapshot = handle.snapshot().expect("snapshot after stop");
    assert_eq!(snapshot.trip.current_passenger_count(), count);
}

#[test]
fn runs_unvalidated_without_face_encoder() {
    let mut handle = start(Some(Box::new(BrokenEncoder)));
    assert!(wait_for(&handle, |h| h.get_statistics().unvalidated_events >= 1));
    handle.stop().expect("stop");

    let stats = handle.get_statistics();
    assert_eq!(stats.unique_passengers_seen, 0);
    assert!(stats.total_entries >= 1);
}

#[test]
fn detector_warm_up_failure_prevents_start() {
    let engine = CountingEngine::new(EngineSettings::default()).expect("engine");
    let result = CountingPipeline::new(
        settings(),
        engine,
        fast_source(),
        Box::new(BrokenDetector),
        None,
    )
    .start();
    assert!(result.is_err());
}

#[test]
fn trip_timeout_rollover_keeps_passengers_aboard() {
    let scenario = BoardingScenario::default();
    let engine = CountingEngine::new(EngineSettings::default()).expect("engine");
    let mut handle = CountingPipeline::new(
        PipelineSettings {
            trip_timeout: Duration::from_millis(300),
            ..settings()
        },
        engine,
        fast_source(),
        Box::new(SimulatedPersonDetector::new(scenario.clone())),
        Some(Box::new(SimulatedFaceEncoder::new(scenario))),
    )
    .start()
    .expect("pipeline start");

    assert!(wait_for(&handle, |h| h.get_current_count() >= 1));
    let first = handle.ledger().trip().id().to_string();
    assert!(
        wait_for(&handle, |h| h.ledger().trip().id() != first),
        "trip never rolled over"
    );
    handle.stop().expect("stop");

    let snapshot = handle.snapshot().expect("snapshot");
    let aboard = snapshot
        .passengers
        .iter()
        .filter(|record| record.status.is_aboard())
        .count();
    assert!(aboard >= 1);
    assert_ne!(snapshot.trip.id(), first);
    assert_eq!(snapshot.trip.current_passenger_count() as usize, aboard);
}

#[test]
fn reset_clears_counts_after_stop() {
    let mut handle = start(None);
    assert!(wait_for(&handle, |h| h.get_current_count() >= 1));
    handle.stop().expect("stop");

    handle.reset().expect("reset");
    assert_eq!(handle.get_current_count(), 0);
    assert_eq!(handle.get_statistics().total_entries, 0);
}
