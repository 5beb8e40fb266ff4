// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Camera supervisor - one pipeline per camera, keyed by camera id
//!
//! Cameras never share tracker or engine state. What they do share is
//! read-only or internally synchronised: the inference backend, the
//! validator, the delivery queue, the event bus and storage.

pub mod health;
mod pipeline;

pub use health::{CameraHealth, PipelineHealth};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, Config, DatabaseConfig, EventConfig, SupervisorConfig};
use crate::core::{EventBus, Frame};
use crate::db::Database;
use crate::delivery::{DeliveryDiagnostics, DeliveryQueue};
use crate::detection::{Detector, DetectorSettings, InferenceBackend};
use crate::error::{PipelineError, Result};
use crate::events::EventType;
use crate::evidence::EvidenceSink;
use crate::stream::{DropOldestQueue, FfmpegConnector, ReaderSettings, StreamConnector, StreamReader, StreamStatus};
use crate::tracking::TrackerSettings;
use crate::validation::{GateCounts, Validator};
use pipeline::PipelineContext;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Process-wide services handed to every camera pipeline
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn InferenceBackend>,
    pub validator: Arc<Validator>,
    pub delivery: Arc<DeliveryQueue>,
    pub event_bus: Arc<EventBus>,
    pub database: Option<Database>,
    pub evidence: Option<Arc<dyn EvidenceSink>>,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub events: EventConfig,
    pub supervisor: SupervisorConfig,
}

impl Services {
    pub fn new(
        config: &Config,
        backend: Arc<dyn InferenceBackend>,
        validator: Arc<Validator>,
        delivery: Arc<DeliveryQueue>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            validator,
            delivery,
            event_bus,
            database: None,
            evidence: None,
            detector: DetectorSettings::from(&config.detector),
            tracker: TrackerSettings::from(&config.tracker),
            events: config.events.clone(),
            supervisor: config.supervisor.clone(),
        }
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_evidence(mut self, sink: Arc<dyn EvidenceSink>) -> Self {
        self.evidence = Some(sink);
        self
    }

    fn reader_settings(&self) -> ReaderSettings {
        let s = &self.supervisor;
        ReaderSettings {
            stall_timeout: Duration::from_secs(s.stall_timeout_secs.max(1)),
            backoff_initial: Duration::from_secs(s.backoff_initial_secs.max(1)),
            backoff_max: Duration::from_secs(s.backoff_max_secs.max(s.backoff_initial_secs).max(1)),
        }
    }
}

/// Builds the stream connector for a camera
pub type ConnectorFactory = Arc<dyn Fn(&CameraConfig) -> Arc<dyn StreamConnector> + Send + Sync>;

/// Network cameras through ffmpeg
pub fn ffmpeg_connectors() -> ConnectorFactory {
    Arc::new(|camera: &CameraConfig| {
        Arc::new(FfmpegConnector::new(&camera.url, camera.target_size())) as Arc<dyn StreamConnector>
    })
}

/// A running camera
struct CameraPipeline {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    health: Arc<PipelineHealth>,
}

/// Everything the diagnostics surface reports
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub cameras: Vec<CameraHealth>,
    /// Cameras refused at start, with the reason
    pub failed_cameras: BTreeMap<String, String>,
    pub delivery: DeliveryDiagnostics,
    pub validator_scorer: String,
    pub validation: BTreeMap<EventType, GateCounts>,
}

/// Owns the camera pipelines
pub struct CameraSupervisor {
    services: Services,
    connectors: ConnectorFactory,
    pipelines: RwLock<HashMap<String, CameraPipeline>>,
    failed: RwLock<BTreeMap<String, String>>,
}

impl CameraSupervisor {
    pub fn new(services: Services, connectors: ConnectorFactory) -> Self {
        Self {
            services,
            connectors,
            pipelines: RwLock::new(HashMap::new()),
            failed: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Start one camera. A bad configuration fails this camera only and is
    /// kept for diagnostics.
    pub fn start_camera(&self, camera: CameraConfig) -> Result<()> {
        if !camera.enabled {
            debug!(camera_id = %camera.id, "Camera disabled, not starting");
            return Ok(());
        }

        let zones = match camera.validate().and_then(|_| camera.compile_zones()) {
            Ok(zones) => zones,
            Err(e) => {
                error!(camera_id = %camera.id, "Camera not started: {}", e);
                self.failed.write().insert(camera.id.clone(), e.to_string());
                self.services.event_bus.publish_fault(&camera.id, e.code(), &e.to_string());
                return Err(e);
            }
        };

        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&camera.id) {
            return Err(PipelineError::Configuration(format!(
                "camera '{}' is already running",
                camera.id
            )));
        }

        let connector = (self.connectors)(&camera);
        let reader_settings = self.services.reader_settings();
        let queue = Arc::new(DropOldestQueue::<Frame>::new(
            self.services.supervisor.frame_queue_capacity.max(1),
        ));
        let (reader, health_rx) = StreamReader::new(
            &camera.id,
            connector.clone(),
            reader_settings.clone(),
            self.services.event_bus.clone(),
        );
        let health = Arc::new(PipelineHealth::new(&camera.id, queue.clone(), health_rx));

        let ctx = Arc::new(PipelineContext {
            camera_id: camera.id.clone(),
            fps: camera.fps,
            zones: Arc::new(zones),
            events: self.services.events.with_overrides(&camera.overrides),
            connector,
            reader_settings,
            detector: Arc::new(Detector::new(self.services.backend.clone(), self.services.detector.clone())),
            queue,
            health: health.clone(),
            services: self.services.clone(),
        });

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(pipeline::run(ctx, reader, stop_rx));

        info!(
            camera_id = %camera.id,
            zones = camera.zones.len(),
            fps = camera.fps,
            "Camera pipeline started"
        );
        self.failed.write().remove(&camera.id);
        pipelines.insert(
            camera.id.clone(),
            CameraPipeline {
                stop,
                task,
                health,
            },
        );
        Ok(())
    }

    /// Start every camera, returning how many are running
    pub fn start_all(&self, cameras: &[CameraConfig]) -> usize {
        for camera in cameras {
            // failures are logged and recorded by start_camera
            let _ = self.start_camera(camera.clone());
        }
        self.pipelines.read().len()
    }

    /// Stop one camera and release its state. False if it was not running.
    pub async fn stop_camera(&self, camera_id: &str) -> bool {
        let pipeline = self.pipelines.write().remove(camera_id);
        let Some(mut pipeline) = pipeline else {
            return false;
        };

        let _ = pipeline.stop.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut pipeline.task).await.is_err() {
            warn!(camera_id, "Pipeline did not stop in time, aborting");
            pipeline.task.abort();
        }
        info!(camera_id, "Camera pipeline stopped");
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.pipelines.read().keys().cloned().collect();
        futures::future::join_all(ids.iter().map(|id| self.stop_camera(id))).await;
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn health(&self, camera_id: &str) -> Option<CameraHealth> {
        self.pipelines.read().get(camera_id).map(|p| p.health.snapshot())
    }

    pub fn health_all(&self) -> Vec<CameraHealth> {
        let mut all: Vec<CameraHealth> = self.pipelines.read().values().map(|p| p.health.snapshot()).collect();
        all.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        all
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            cameras: self.health_all(),
            failed_cameras: self.failed.read().clone(),
            delivery: self.services.delivery.diagnostics(),
            validator_scorer: self.services.validator.scorer_name().to_string(),
            validation: self.services.validator.counts(),
        }
    }

    /// Periodic health refresh and summary log
    pub async fn run_health_monitor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.services.supervisor.health_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let healths: Vec<Arc<PipelineHealth>> =
                        self.pipelines.read().values().map(|p| p.health.clone()).collect();
                    for health in healths {
                        let h = health.refresh();
                        info!(
                            camera_id = %h.camera_id,
                            status = ?h.status,
                            fps = format!("{:.1}", h.fps),
                            detections_per_sec = format!("{:.1}", h.detections_per_sec),
                            queue_depth = h.queue_depth,
                            active_tracks = h.active_tracks,
                            armed_objects = h.armed_objects,
                            accepted = h.candidates_accepted,
                            rejected = h.candidates_rejected,
                            "Camera health"
                        );
                        if h.status == StreamStatus::Failed {
                            warn!(camera_id = %h.camera_id, "Stream failed: {}", h.last_error.as_deref().unwrap_or("unknown"));
                        } else if let Some(err) = &h.last_error {
                            debug!(camera_id = %h.camera_id, "Last error: {}", err);
                        }
                    }

                    let delivery = self.services.delivery.diagnostics();
                    info!(
                        pending = delivery.pending,
                        sent = delivery.sent,
                        failed = delivery.failed,
                        "Delivery queue"
                    );
                }
                _ = shutdown.recv() => {
                    debug!("Health monitor stopped");
                    break;
                }
            }
        }
    }

    /// Retention cleanup for events and terminal outbox rows
    pub async fn run_maintenance(self: Arc<Self>, config: DatabaseConfig, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(config.cleanup_interval_secs.max(60)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let retention = config.retention_days;
                    let database = self.services.database.clone();
                    let delivery = self.services.delivery.clone();
                    let removed = tokio::task::spawn_blocking(move || match database {
                        Some(db) => db.cleanup(retention),
                        None => delivery.purge(retention),
                    })
                    .await;

                    match removed {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => info!("Cleaned up {} old records", n),
                        Ok(Err(e)) => warn!("Cleanup failed: {}", e),
                        Err(e) => error!("Cleanup task failed: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;
    use crate::delivery::{DeliverySettings, MemoryOutbox};
    use crate::demo::{demo_camera, SimulatedBackend, SyntheticConnector};
    use crate::events::ZoneRole;
    use crate::notify::LogNotifier;

    fn supervisor() -> CameraSupervisor {
        let config = Config::default();
        let delivery = Arc::new(DeliveryQueue::new(
            Arc::new(MemoryOutbox::new()),
            Arc::new(LogNotifier),
            DeliverySettings::default(),
        ));
        let services = Services::new(
            &config,
            Arc::new(SimulatedBackend::with_seed(1)),
            Arc::new(Validator::from_config(&config.validator, None)),
            delivery,
            Arc::new(EventBus::new(64)),
        );
        let connectors: ConnectorFactory =
            Arc::new(|_: &CameraConfig| Arc::new(SyntheticConnector::new(64, 48, 20.0).with_seed(3)) as Arc<dyn StreamConnector>);
        CameraSupervisor::new(services, connectors)
    }

    #[tokio::test]
    async fn test_bad_camera_fails_alone() {
        let sup = supervisor();
        let mut bad = demo_camera("bad", 64, 48, 5.0);
        bad.zones.push(ZoneConfig {
            id: "sliver".to_string(),
            name: String::new(),
            role: ZoneRole::Monitored,
            polygon: vec![[0.0, 0.0], [10.0, 0.0]],
            schedule: None,
        });

        let running = sup.start_all(&[bad, demo_camera("good", 64, 48, 5.0)]);
        assert_eq!(running, 1);
        assert_eq!(sup.camera_ids(), vec!["good".to_string()]);

        let diag = sup.diagnostics();
        assert!(diag.failed_cameras.contains_key("bad"));
        assert_eq!(diag.validator_scorer, "heuristic");

        assert!(sup.stop_camera("good").await);
        assert!(sup.camera_ids().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_disabled() {
        let sup = supervisor();
        sup.start_camera(demo_camera("a", 64, 48, 5.0)).unwrap();
        assert!(sup.start_camera(demo_camera("a", 64, 48, 5.0)).is_err());

        let mut off = demo_camera("off", 64, 48, 5.0);
        off.enabled = false;
        sup.start_camera(off).unwrap();
        assert_eq!(sup.camera_ids(), vec!["a".to_string()]);

        assert!(!sup.stop_camera("missing").await);
        sup.stop_all().await;
        assert!(sup.health("a").is_none());
    }

    /// Panics on every other frame
    struct Brittle {
        calls: std::sync::atomic::AtomicU64,
    }

    impl InferenceBackend for Brittle {
        fn name(&self) -> &str {
            "brittle"
        }

        fn infer(&self, _image: &ndarray::Array3<u8>) -> Result<Vec<crate::core::Detection>> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % 2 == 1 {
                panic!("backend fault");
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_detector_panic_skips_frame() {
        let base = supervisor();
        let mut services = base.services().clone();
        services.backend = Arc::new(Brittle {
            calls: std::sync::atomic::AtomicU64::new(0),
        });
        let mut faults = services.event_bus.subscribe_events();
        let sup = CameraSupervisor::new(services, base.connectors.clone());
        sup.start_camera(demo_camera("flaky", 64, 48, 10.0)).unwrap();

        let mut survived = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let h = sup.health("flaky").unwrap();
            if h.stage_restarts >= 1 && h.frames_analyzed >= 2 {
                survived = true;
                break;
            }
        }
        assert!(survived);

        let mut saw_fault = false;
        loop {
            match faults.try_recv() {
                Ok(envelope) => {
                    if let crate::core::PipelineEvent::Fault { code, .. } = envelope.event {
                        saw_fault |= code == "DETECTOR_FAULT";
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_fault);

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_camera_connects_and_analyzes() {
        let sup = supervisor();
        sup.start_camera(demo_camera("yard", 64, 48, 10.0)).unwrap();

        let mut analyzed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let h = sup.health("yard").unwrap();
            if h.status == StreamStatus::Connected && h.frames_analyzed > 0 {
                analyzed = true;
                break;
            }
        }
        assert!(analyzed);

        sup.stop_camera("yard").await;
    }
}
