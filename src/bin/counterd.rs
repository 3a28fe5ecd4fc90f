//! counterd - passenger counting daemon
//!
//! This daemon:
//! 1. Loads configuration (`COUNTER_CONFIG` file plus `COUNTER_*` overrides)
//! 2. Restores the last snapshot, if one is configured and present
//! 3. Runs the capture and processing threads over the configured source
//! 4. Serves the read-only counter API on loopback
//! 5. On Ctrl-C: stops the pipeline, then persists the open trip or ends it

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use passenger_kernel::{
    api::{ApiConfig, ApiServer},
    config::CounterConfig,
    detect::{BoardingScenario, SimulatedFaceEncoder, SimulatedPersonDetector},
    CountingEngine, CountingPipeline, FaceEncoder, Snapshot, SyntheticSource,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CounterConfig::load()?;
    log::info!(
        "counterd {} starting for device {} (capacity {})",
        env!("CARGO_PKG_VERSION"),
        config.device_id,
        config.trip.max_capacity
    );

    let mut engine = CountingEngine::new(config.engine_settings())?;
    if let Some(path) = config.snapshot_path.as_deref() {
        if path.exists() {
            match Snapshot::read_from(path) {
                Ok(snapshot) => engine.restore(snapshot),
                Err(e) => log::warn!("ignoring snapshot {}: {}", path.display(), e),
            }
        }
    }
    if !engine.ledger().is_open() {
        let closed = engine.begin_new_trip()?;
        log::info!("restored trip {} was closed; starting a new trip", closed.id());
    }
    let ledger = engine.ledger().clone();

    // Only stub:// sources ship with the crate; camera backends plug in through FrameSource.
    let source = SyntheticSource::new(config.synthetic_source())?;
    let scenario = BoardingScenario::default();
    let detector = SimulatedPersonDetector::new(scenario.clone());
    let encoder: Option<Box<dyn FaceEncoder>> = if config.face_tracking.enabled {
        Some(Box::new(SimulatedFaceEncoder::new(scenario)))
    } else {
        log::warn!("face tracking disabled; every crossing is counted unvalidated");
        None
    };

    let mut pipeline = CountingPipeline::new(
        config.pipeline_settings(),
        engine,
        Box::new(source),
        Box::new(detector),
        encoder,
    )
    .start()?;

    let api_handle = if config.api.enabled {
        let handle = ApiServer::new(
            ApiConfig {
                addr: config.api.addr.clone(),
            },
            ledger.clone(),
        )
        .spawn()?;
        log::info!("counter api listening on {}", handle.addr);
        Some(handle)
    } else {
        None
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("counterd running. press Ctrl-C to stop");
    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) && pipeline.is_running() {
        std::thread::sleep(Duration::from_millis(100));
        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let stats = pipeline.get_statistics();
            log::info!(
                "count={} entries={} exits={} fps={:.1} frames={} dropped={} prevented={} unvalidated={}",
                stats.current_count,
                stats.total_entries,
                stats.total_exits,
                stats.processing_fps,
                stats.frames_captured,
                stats.frames_dropped,
                stats.prevented_double_counts,
                stats.unvalidated_events
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("shutdown requested, stopping pipeline...");
    pipeline.stop()?;
    if let Some(handle) = api_handle {
        handle.stop()?;
    }

    match config.snapshot_path.as_deref() {
        Some(path) => {
            pipeline.snapshot()?.write_to(path)?;
            log::info!(
                "trip {} persisted to {}",
                ledger.trip().id(),
                path.display()
            );
        }
        None => {
            ledger.end_trip()?;
            let summary = ledger.summary();
            log::info!(
                "trip {} ended: {} entries, {} exits, peak {} of {}",
                summary.trip_id,
                summary.total_entries,
                summary.total_exits,
                summary.max_passenger_count,
                summary.max_capacity
            );
        }
    }
    Ok(())
}
