//! trip_demo - offline replay of a trip through the counting core
//!
//! Two stages, both synchronous and deterministic:
//! 1. `--counts`: feed detector-style passenger counts straight into a trip
//!    (capacity edges, clamping, summary).
//! 2. `--frames`: replay the simulated boarding scenario frame by frame through the
//!    full engine (zones, tracks, identities, fusion) with synthetic timestamps.
//!
//! Prints the summaries and the trip event logs as JSON on stdout.

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use serde_json::json;

use passenger_kernel::{
    detect::{BoardingScenario, SimulatedFaceEncoder, SimulatedPersonDetector},
    CountingEngine, EngineSettings, FaceEncoder, Frame, PersonDetector, Trip,
};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Vehicle capacity; counts above it raise overload events.
    #[arg(long, default_value_t = 14)]
    capacity: u32,
    /// Comma-separated passenger counts to replay into the trip.
    #[arg(long, default_value = "2,5,8,12,15,13,10,7,4,1,0")]
    counts: String,
    /// Frames of simulated boarding to replay through the engine (0 to skip).
    #[arg(long, default_value_t = 600)]
    frames: u64,
    /// Frame rate used to derive synthetic timestamps.
    #[arg(long, default_value_t = 15)]
    fps: u32,
    /// Process every Nth frame, as the pipeline does.
    #[arg(long, default_value_t = 3)]
    every: u64,
    /// Device id stamped on the trips.
    #[arg(long, default_value = "taxi_dev_001")]
    device: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.capacity == 0 {
        return Err(anyhow!("capacity must be >= 1"));
    }
    if args.fps == 0 || args.every == 0 {
        return Err(anyhow!("fps and every must be >= 1"));
    }

    stage("replay passenger counts");
    let counts = parse_counts(&args.counts)?;
    let count_trip = replay_counts(&args.device, args.capacity, &counts)?;

    let engine_trip = if args.frames > 0 {
        stage("replay simulated boarding");
        Some(replay_frames(&args)?)
    } else {
        None
    };

    let mut report = json!({
        "count_replay": {
            "summary": count_trip.summary(Utc::now()),
            "events": count_trip.events(),
        }
    });
    if let Some(trip) = engine_trip {
        report["engine_replay"] = json!({
            "summary": trip.summary(Utc::now()),
            "events": trip.events(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("trip_demo: {}", msg);
}

fn parse_counts(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| anyhow!("invalid count '{}': {}", s, e))
        })
        .collect()
}

fn replay_counts(device: &str, capacity: u32, counts: &[i64]) -> Result<Trip> {
    let mut trip = Trip::new(device, capacity);
    let start = Utc::now();
    trip.start(start)?;
    for (i, count) in counts.iter().enumerate() {
        let at = start + ChronoDuration::seconds(30 * (i as i64 + 1));
        trip.update_passenger_count(*count, at)?;
        eprintln!(
            "trip_demo:   t+{:>4}s count={:>3} overloaded={}",
            30 * (i + 1),
            trip.current_passenger_count(),
            trip.is_overloaded()
        );
    }
    let end = start + ChronoDuration::seconds(30 * (counts.len() as i64 + 1));
    trip.end(end)?;
    Ok(trip)
}

fn replay_frames(args: &Args) -> Result<Trip> {
    let mut engine = CountingEngine::new(EngineSettings {
        device_id: args.device.clone(),
        max_capacity: args.capacity,
        ..EngineSettings::default()
    })?;
    engine.events_mut().add_callback(|event| {
        eprintln!(
            "trip_demo:   {} {} identity={} count={}",
            event.kind,
            event.track,
            event
                .identity
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unvalidated".to_string()),
            event.passenger_count
        );
        Ok(())
    });

    let scenario = BoardingScenario::default();
    let mut detector = SimulatedPersonDetector::new(scenario.clone());
    let mut encoder = SimulatedFaceEncoder::new(scenario);
    let start = Utc::now();
    let frame_ms = 1000 / i64::from(args.fps);

    for sequence in (0..args.frames).filter(|seq| seq % args.every == 0) {
        let frame = Frame::new(Vec::new(), FRAME_WIDTH, FRAME_HEIGHT, sequence);
        let persons = detector.detect(&frame)?;
        let faces = encoder.detect_faces(&frame)?;
        let now = start + ChronoDuration::milliseconds(frame_ms * sequence as i64);
        engine.process_cycle(FRAME_WIDTH, FRAME_HEIGHT, persons, Some(faces), now)?;
    }

    let stats = engine.fusion().stats();
    eprintln!(
        "trip_demo:   unique={} prevented={} temporary_exits={} unvalidated={}",
        stats.unique_passengers_seen,
        stats.prevented_double_counts,
        stats.temporary_exits_handled,
        stats.unvalidated_events
    );
    engine.ledger().end_trip()?;
    Ok(engine.ledger().trip())
}
