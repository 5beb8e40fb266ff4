// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Configuration module

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::PipelineError;
use crate::events::{EventType, Zone, ZoneRole};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Run against synthetic cameras and a simulated detector
    pub demo_mode: bool,

    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub events: EventConfig,
    pub validator: ValidatorConfig,
    pub delivery: DeliveryConfig,
    pub notifier: NotifierConfig,
    pub evidence: EvidenceConfig,
    pub database: DatabaseConfig,
    pub supervisor: SupervisorConfig,

    /// Cameras to run
    pub cameras: Vec<CameraConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            demo_mode: true,
            detector: DetectorConfig::default(),
            tracker: TrackerConfig::default(),
            events: EventConfig::default(),
            validator: ValidatorConfig::default(),
            delivery: DeliveryConfig::default(),
            notifier: NotifierConfig::default(),
            evidence: EvidenceConfig::default(),
            database: DatabaseConfig::default(),
            supervisor: SupervisorConfig::default(),
            cameras: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("sentryline"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Process-wide checks. Camera problems are reported per camera at start.
    pub fn validate(&self) -> crate::error::Result<()> {
        let cfg_err = |msg: String| Err(PipelineError::Configuration(msg));

        if self.delivery.max_attempts == 0 {
            return cfg_err("delivery.max_attempts must be at least 1".into());
        }
        if self.delivery.backoff_secs.is_empty() {
            return cfg_err("delivery.backoff_secs must not be empty".into());
        }
        if self.delivery.capacity == 0 {
            return cfg_err("delivery.capacity must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return cfg_err("detector.confidence_threshold must be within [0, 1]".into());
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id.as_str()) {
                return cfg_err(format!("duplicate camera id '{}'", camera.id));
            }
        }
        Ok(())
    }
}

/// Object detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// YOLO model in ONNX format; required outside demo mode
    pub model_path: Option<PathBuf>,

    /// Square model input edge in pixels
    pub input_size: usize,

    pub confidence_threshold: f32,

    /// Same-class overlap at or above this collapses to one box
    pub iou_threshold: f32,

    pub max_detections: usize,

    /// Model class names; empty means COCO
    pub labels: Vec<String>,

    /// Classes passed on to the tracker; empty keeps everything
    pub classes_of_interest: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: 640,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            max_detections: 300,
            labels: Vec::new(),
            classes_of_interest: vec![
                "person".to_string(),
                "backpack".to_string(),
                "handbag".to_string(),
                "suitcase".to_string(),
                "laptop".to_string(),
                "cell phone".to_string(),
                "bottle".to_string(),
            ],
        }
    }
}

/// Tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Largest centroid jump, in pixels, still associated with a track
    pub max_match_distance: f32,

    pub max_inactive_age_secs: f64,

    /// Detections kept per track
    pub history_len: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance: 150.0,
            max_inactive_age_secs: 30.0,
            history_len: 300,
        }
    }
}

/// Temporal event rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub person_class: String,

    pub intrusion_dwell_secs: f64,
    /// Largest gap between two sightings credited to dwell
    pub max_dwell_step_secs: f64,

    pub loitering_threshold_secs: f64,
    pub loitering_movement_px: f32,

    /// More distinct tracks than this inside a zone is a crowd
    pub crowd_threshold: usize,
    pub crowd_window_secs: f64,

    /// Object classes watched for removal
    pub monitored_classes: Vec<String>,
    /// Consecutive frames inside a protected zone before an object is armed
    pub removal_stable_frames: u32,
    /// Unseen this long counts as gone
    pub removal_grace_secs: f64,
    /// A person must be at an exit within this window of the disappearance
    pub removal_exit_window_secs: f64,
    /// A person must have come this close to the object while it was armed
    pub removal_proximity_px: f32,
    /// A person within this distance of an exit zone counts as at the exit
    pub removal_exit_proximity_px: f32,

    /// Per-track state untouched this long is purged
    pub state_max_age_secs: f64,
    pub sweep_interval_secs: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            person_class: "person".to_string(),
            intrusion_dwell_secs: 3.0,
            max_dwell_step_secs: 2.0,
            loitering_threshold_secs: 60.0,
            loitering_movement_px: 100.0,
            crowd_threshold: 10,
            crowd_window_secs: 30.0,
            monitored_classes: vec![
                "backpack".to_string(),
                "handbag".to_string(),
                "suitcase".to_string(),
                "laptop".to_string(),
                "cell phone".to_string(),
                "bottle".to_string(),
            ],
            removal_stable_frames: 10,
            removal_grace_secs: 2.0,
            removal_exit_window_secs: 10.0,
            removal_proximity_px: 100.0,
            removal_exit_proximity_px: 50.0,
            state_max_age_secs: 30.0,
            sweep_interval_secs: 5,
        }
    }
}

impl EventConfig {
    /// Apply a camera's overrides on top of the global rules
    pub fn with_overrides(&self, overrides: &EventOverrides) -> EventConfig {
        let mut merged = self.clone();
        if let Some(v) = overrides.intrusion_dwell_secs {
            merged.intrusion_dwell_secs = v;
        }
        if let Some(v) = overrides.loitering_threshold_secs {
            merged.loitering_threshold_secs = v;
        }
        if let Some(v) = overrides.loitering_movement_px {
            merged.loitering_movement_px = v;
        }
        if let Some(v) = overrides.crowd_threshold {
            merged.crowd_threshold = v;
        }
        if let Some(classes) = &overrides.monitored_classes {
            merged.monitored_classes = classes.clone();
        }
        merged
    }
}

/// Per-camera rule overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventOverrides {
    pub intrusion_dwell_secs: Option<f64>,
    pub loitering_threshold_secs: Option<f64>,
    pub loitering_movement_px: Option<f32>,
    pub crowd_threshold: Option<usize>,
    pub monitored_classes: Option<Vec<String>>,
}

/// One value per event type
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerEventType {
    pub intrusion: f32,
    pub loitering: f32,
    pub crowd_anomaly: f32,
    pub removal_pattern: f32,
}

impl PerEventType {
    pub fn get(&self, event_type: EventType) -> f32 {
        match event_type {
            EventType::Intrusion => self.intrusion,
            EventType::Loitering => self.loitering,
            EventType::CrowdAnomaly => self.crowd_anomaly,
            EventType::RemovalPattern => self.removal_pattern,
        }
    }
}

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Minimum score for acceptance
    pub thresholds: PerEventType,

    /// Heuristic discount applied to raw confidence
    pub factors: PerEventType,

    /// Secondary ONNX model scoring evidence crops; unset uses the heuristic
    pub model_path: Option<PathBuf>,

    /// Square classifier input edge in pixels
    pub model_input_size: usize,

    /// Evidence crop padding, fraction of the box size
    pub crop_padding: f32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            thresholds: PerEventType {
                intrusion: 0.70,
                loitering: 0.60,
                crowd_anomaly: 0.65,
                removal_pattern: 0.80,
            },
            factors: PerEventType {
                intrusion: 1.0,
                loitering: 0.95,
                crowd_anomaly: 0.9,
                removal_pattern: 0.85,
            },
            model_path: None,
            model_input_size: 224,
            crop_padding: 0.1,
        }
    }
}

/// Delivery queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Pending messages accepted before enqueue fails
    pub capacity: usize,

    pub max_attempts: u32,

    /// Delay after the n-th failure; the last entry repeats
    pub backoff_secs: Vec<u64>,

    pub worker_interval_secs: u64,

    /// Messages handled per worker tick
    pub batch_size: usize,

    pub send_timeout_secs: u64,

    /// Recipients stamped on every message
    pub recipients: Vec<String>,

    /// Attempt pending in-memory messages once at shutdown
    pub drain_on_shutdown: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_attempts: 5,
            backoff_secs: vec![60, 120, 300, 600, 1800],
            worker_interval_secs: 30,
            batch_size: 50,
            send_timeout_secs: 30,
            recipients: Vec::new(),
            drain_on_shutdown: true,
        }
    }
}

/// Notifier backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Log,
    Webhook,
    Mqtt,
}

/// Notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub kind: NotifierKind,

    pub webhook_url: String,
    pub webhook_token: Option<String>,

    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::Log,
            webhook_url: "http://localhost:8080/alerts".to_string(),
            webhook_token: None,
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "sentryline".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic: "sentryline/alerts".to_string(),
        }
    }
}

/// Evidence snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub enabled: bool,
    pub snapshot_dir: PathBuf,
    /// Crop padding, fraction of the box size
    pub padding: f32,
    pub jpeg_quality: u8,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_dir: PathBuf::from("./data/snapshots"),
            padding: 0.15,
            jpeg_quality: 85,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Enable database storage; the outbox falls back to memory when off
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,

    /// Retention period in days
    pub retention_days: u32,

    pub cleanup_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/sentryline.db"),
            retention_days: 30,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Camera supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_interval_secs: u64,

    /// Frames buffered between reader and analysis
    pub frame_queue_capacity: usize,

    /// No frame for this long drops the connection
    pub stall_timeout_secs: u64,

    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,

    pub event_bus_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            frame_queue_capacity: 2,
            stall_timeout_secs: 10,
            backoff_initial_secs: 1,
            backoff_max_secs: 60,
            event_bus_capacity: 256,
        }
    }
}

/// One camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,

    /// Analysis rate
    pub fps: f64,

    /// Canonical frame size; the source size is used when unset
    pub width: Option<u32>,
    pub height: Option<u32>,

    pub zones: Vec<ZoneConfig>,

    pub overrides: EventOverrides,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: "camera-1".to_string(),
            name: "Camera 1".to_string(),
            url: String::new(),
            enabled: true,
            fps: 5.0,
            width: Some(1280),
            height: Some(720),
            zones: Vec::new(),
            overrides: EventOverrides::default(),
        }
    }
}

impl CameraConfig {
    pub fn target_size(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }

    /// Compile zones, rejecting anything malformed
    pub fn compile_zones(&self) -> crate::error::Result<Vec<Zone>> {
        let mut ids = HashSet::new();
        let mut zones = Vec::with_capacity(self.zones.len());
        for zone in &self.zones {
            if !ids.insert(zone.id.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "camera '{}': duplicate zone id '{}'",
                    self.id, zone.id
                )));
            }
            let compiled = Zone::from_config(zone).map_err(|e| match e {
                PipelineError::Configuration(msg) => {
                    PipelineError::Configuration(format!("camera '{}': {}", self.id, msg))
                }
                other => other,
            })?;
            zones.push(compiled);
        }
        Ok(zones)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let cfg_err = |msg: String| Err(PipelineError::Configuration(msg));

        if self.id.trim().is_empty() {
            return cfg_err("camera id must not be empty".into());
        }
        if self.url.trim().is_empty() {
            return cfg_err(format!("camera '{}': url must not be empty", self.id));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return cfg_err(format!("camera '{}': fps must be positive", self.id));
        }
        if self.width.is_some() != self.height.is_some() || matches!(self.width, Some(0)) || matches!(self.height, Some(0)) {
            return cfg_err(format!("camera '{}': width and height must be set together and non-zero", self.id));
        }
        self.compile_zones().map(|_| ())
    }
}

/// Zone as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: ZoneRole,
    /// Vertices in frame pixels
    pub polygon: Vec<[f32; 2]>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

/// Active windows; the zone is always active without one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local time offset from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
    pub windows: Vec<WindowConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// "mon".."sun"; empty means every day
    #[serde(default)]
    pub days: Vec<String>,
    /// "HH:MM" or "HH:MM:SS"
    pub start: String,
    pub end: String,
}
