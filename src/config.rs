use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counter::EngineSettings;
use crate::fusion::FusionSettings;
use crate::identity::IdentitySettings;
use crate::ingest::SyntheticConfig;
use crate::pipeline::PipelineSettings;
use crate::track::{TrackAssignment, DEFAULT_TRACK_MATCH_DISTANCE_PX};
use crate::zone::{default_zones, Zone, ZoneClassifier};

const DEFAULT_DEVICE_ID: &str = "taxi_dev_001";
const DEFAULT_SOURCE_URL: &str = "stub://cabin_camera";
const DEFAULT_SOURCE_FPS: u32 = 15;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_BUFFER_CAPACITY: usize = 10;
const DEFAULT_EVERY_N_FRAMES: u64 = 3;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_TOLERANCE: f32 = 0.6;
const DEFAULT_MAX_TRACKING_SECS: u64 = 10;
const DEFAULT_MIN_FACE_SIZE: f32 = 50.0;
const DEFAULT_MATCH_DISTANCE_PX: f32 = 100.0;
const DEFAULT_TEMPORARY_EXIT_SECS: u64 = 30;
const DEFAULT_RECORD_RETENTION_SECS: u64 = 60 * 60;
const DEFAULT_MAX_CAPACITY: u32 = 14;
const DEFAULT_TRIP_TIMEOUT_MINUTES: u64 = 120;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8787";

#[derive(Debug, Deserialize, Default)]
struct CounterConfigFile {
    device_id: Option<String>,
    source: Option<SourceConfigFile>,
    processing: Option<ProcessingConfigFile>,
    zones: Option<Vec<Zone>>,
    face_tracking: Option<FaceTrackingConfigFile>,
    trip: Option<TripConfigFile>,
    api: Option<ApiConfigFile>,
    snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    process_every_n_frames: Option<u64>,
    frame_timeout_ms: Option<u64>,
    confidence_threshold: Option<f32>,
    track_assignment: Option<String>,
    track_match_distance_px: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct FaceTrackingConfigFile {
    enabled: Option<bool>,
    tolerance: Option<f32>,
    max_tracking_time_secs: Option<u64>,
    min_face_size: Option<f32>,
    match_distance_px: Option<f32>,
    temporary_exit_timeout_secs: Option<u64>,
    record_retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TripConfigFile {
    max_capacity: Option<u32>,
    timeout_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub device_id: String,
    pub source: SourceSettings,
    pub processing: ProcessingSettings,
    pub zones: Vec<Zone>,
    pub face_tracking: FaceTrackingSettings,
    pub trip: TripSettings,
    pub api: ApiSettings,
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub process_every_n_frames: u64,
    pub frame_timeout: Duration,
    pub confidence_threshold: f32,
    pub track_assignment: TrackAssignment,
}

#[derive(Debug, Clone)]
pub struct FaceTrackingSettings {
    pub enabled: bool,
    pub tolerance: f32,
    pub max_tracking_time: Duration,
    pub min_face_size: f32,
    pub match_distance_px: f32,
    pub temporary_exit_timeout: Duration,
    pub record_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct TripSettings {
    pub max_capacity: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub enabled: bool,
    pub addr: String,
}

impl CounterConfig {
    /// Load from `COUNTER_CONFIG` (if set), then environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("COUNTER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CounterConfigFile) -> Result<Self> {
        let device_id = file
            .device_id
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());

        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: source_file
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source_file.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source_file.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source_file.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            buffer_capacity: source_file
                .buffer_capacity
                .unwrap_or(DEFAULT_BUFFER_CAPACITY),
        };

        let processing_file = file.processing.unwrap_or_default();
        let track_match_distance_px = processing_file
            .track_match_distance_px
            .unwrap_or(DEFAULT_TRACK_MATCH_DISTANCE_PX);
        let track_assignment = match processing_file.track_assignment.as_deref() {
            None | Some("nearest_center") => TrackAssignment::NearestCenter {
                max_distance_px: track_match_distance_px,
            },
            Some("detection_order") => TrackAssignment::DetectionOrder,
            Some(other) => {
                return Err(anyhow!(
                    "processing.track_assignment must be nearest_center or detection_order, got '{}'",
                    other
                ))
            }
        };
        let processing = ProcessingSettings {
            process_every_n_frames: processing_file
                .process_every_n_frames
                .unwrap_or(DEFAULT_EVERY_N_FRAMES),
            frame_timeout: Duration::from_millis(
                processing_file
                    .frame_timeout_ms
                    .unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            confidence_threshold: processing_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            track_assignment,
        };

        let face_file = file.face_tracking.unwrap_or_default();
        let face_tracking = FaceTrackingSettings {
            enabled: face_file.enabled.unwrap_or(true),
            tolerance: face_file.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            max_tracking_time: Duration::from_secs(
                face_file
                    .max_tracking_time_secs
                    .unwrap_or(DEFAULT_MAX_TRACKING_SECS),
            ),
            min_face_size: face_file.min_face_size.unwrap_or(DEFAULT_MIN_FACE_SIZE),
            match_distance_px: face_file
                .match_distance_px
                .unwrap_or(DEFAULT_MATCH_DISTANCE_PX),
            temporary_exit_timeout: Duration::from_secs(
                face_file
                    .temporary_exit_timeout_secs
                    .unwrap_or(DEFAULT_TEMPORARY_EXIT_SECS),
            ),
            record_retention: Duration::from_secs(
                face_file
                    .record_retention_secs
                    .unwrap_or(DEFAULT_RECORD_RETENTION_SECS),
            ),
        };

        let trip_file = file.trip.unwrap_or_default();
        let trip = TripSettings {
            max_capacity: trip_file.max_capacity.unwrap_or(DEFAULT_MAX_CAPACITY),
            timeout: Duration::from_secs(
                trip_file
                    .timeout_minutes
                    .unwrap_or(DEFAULT_TRIP_TIMEOUT_MINUTES)
                    * 60,
            ),
        };

        let api_file = file.api.unwrap_or_default();
        let api = ApiSettings {
            enabled: api_file.enabled.unwrap_or(true),
            addr: api_file
                .addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        };

        Ok(Self {
            device_id,
            source,
            processing,
            zones: file.zones.unwrap_or_else(default_zones),
            face_tracking,
            trip,
            api,
            snapshot_path: file.snapshot_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device_id) = std::env::var("COUNTER_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("COUNTER_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(capacity) = std::env::var("COUNTER_MAX_CAPACITY") {
            self.trip.max_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("COUNTER_MAX_CAPACITY must be a positive integer"))?;
        }
        if let Ok(addr) = std::env::var("COUNTER_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(flag) = std::env::var("COUNTER_FACE_TRACKING") {
            self.face_tracking.enabled = parse_bool(&flag)
                .ok_or_else(|| anyhow!("COUNTER_FACE_TRACKING must be true or false"))?;
        }
        if let Ok(path) = std::env::var("COUNTER_SNAPSHOT_PATH") {
            if !path.trim().is_empty() {
                self.snapshot_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        ZoneClassifier::new(self.zones.clone())?;

        if self.device_id.is_empty() {
            return Err(anyhow!("device_id must not be empty"));
        }
        if self.trip.max_capacity == 0 {
            return Err(anyhow!("trip.max_capacity must be greater than zero"));
        }
        if self.trip.timeout.as_secs() == 0 {
            return Err(anyhow!("trip.timeout_minutes must be greater than zero"));
        }
        if self.processing.process_every_n_frames == 0 {
            return Err(anyhow!("processing.process_every_n_frames must be >= 1"));
        }
        let threshold = self.processing.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "processing.confidence_threshold must be within [0, 1]"
            ));
        }
        if let TrackAssignment::NearestCenter { max_distance_px } = self.processing.track_assignment
        {
            if !(max_distance_px.is_finite() && max_distance_px > 0.0) {
                return Err(anyhow!(
                    "processing.track_match_distance_px must be greater than zero"
                ));
            }
        }
        let face = &self.face_tracking;
        if !(face.tolerance.is_finite() && face.tolerance > 0.0) {
            return Err(anyhow!("face_tracking.tolerance must be greater than zero"));
        }
        if !(face.match_distance_px.is_finite() && face.match_distance_px > 0.0) {
            return Err(anyhow!(
                "face_tracking.match_distance_px must be greater than zero"
            ));
        }
        if face.min_face_size < 0.0 {
            return Err(anyhow!("face_tracking.min_face_size must not be negative"));
        }
        if self.source.buffer_capacity == 0 {
            return Err(anyhow!("source.buffer_capacity must be >= 1"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source.target_fps must be >= 1"));
        }
        if self.api.enabled {
            self.api
                .addr
                .parse::<SocketAddr>()
                .map_err(|e| anyhow!("invalid api.addr '{}': {}", self.api.addr, e))?;
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let face = &self.face_tracking;
        EngineSettings {
            device_id: self.device_id.clone(),
            max_capacity: self.trip.max_capacity,
            confidence_threshold: self.processing.confidence_threshold,
            zones: self.zones.clone(),
            track_assignment: self.processing.track_assignment,
            face_tracking: face.enabled,
            identity: IdentitySettings {
                tolerance: face.tolerance,
                max_tracking_time: face.max_tracking_time,
                min_face_size: face.min_face_size,
            },
            fusion: FusionSettings {
                match_distance_px: face.match_distance_px,
                temporary_exit_timeout: face.temporary_exit_timeout,
                record_retention: face.record_retention,
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            buffer_capacity: self.source.buffer_capacity,
            process_every_n_frames: self.processing.process_every_n_frames,
            frame_timeout: self.processing.frame_timeout,
            trip_timeout: self.trip.timeout,
        }
    }

    pub fn synthetic_source(&self) -> SyntheticConfig {
        SyntheticConfig {
            url: self.source.url.clone(),
            target_fps: self.source.target_fps,
            width: self.source.width,
            height: self.source.height,
            max_frames: None,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CounterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
