// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! End-to-end camera pipeline runs against scripted streams

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array3;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use sentryline::config::{CameraConfig, Config, ZoneConfig};
use sentryline::core::PipelineEvent;
use sentryline::delivery::{DeliverySettings, MemoryOutbox, QueuedMessage};
use sentryline::detection::InferenceBackend;
use sentryline::events::ZoneRole;
use sentryline::notify::Notifier;
use sentryline::stream::{StreamConnector, StreamSession, StreamStatus};
use sentryline::supervisor::ConnectorFactory;
use sentryline::validation::Validator;
use sentryline::{
    BBox, CameraSupervisor, Database, DeliveryQueue, Detection, EventBus, EventType, PipelineError, Services,
};

/// A person standing still inside the door zone on every frame
struct StandingPerson;

impl InferenceBackend for StandingPerson {
    fn name(&self) -> &str {
        "standing-person"
    }

    fn infer(&self, _image: &Array3<u8>) -> sentryline::Result<Vec<Detection>> {
        Ok(vec![Detection::new(0, "person", 0.9, BBox::new(20.0, 20.0, 40.0, 60.0))])
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<QueuedMessage>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &QueuedMessage) -> sentryline::Result<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

enum Step {
    /// A session that ends after this many frames
    Frames(usize),
    /// A refused connection
    Refuse,
}

/// Follows the plan, then streams forever
struct PacedConnector {
    plan: Mutex<VecDeque<Step>>,
    period: Duration,
}

impl PacedConnector {
    fn new(plan: Vec<Step>) -> Self {
        Self {
            plan: Mutex::new(plan.into_iter().collect()),
            period: Duration::from_millis(20),
        }
    }
}

#[async_trait]
impl StreamConnector for PacedConnector {
    async fn connect(&self, camera_id: &str) -> sentryline::Result<Box<dyn StreamSession>> {
        let step = self.plan.lock().pop_front();
        let remaining = match step {
            Some(Step::Refuse) => return Err(PipelineError::stream_unavailable(camera_id, "connection refused")),
            Some(Step::Frames(n)) => Some(n),
            None => None,
        };
        Ok(Box::new(PacedSession {
            camera_id: camera_id.to_string(),
            remaining,
            period: self.period,
        }))
    }
}

struct PacedSession {
    camera_id: String,
    remaining: Option<usize>,
    period: Duration,
}

#[async_trait]
impl StreamSession for PacedSession {
    async fn next_frame(&mut self) -> sentryline::Result<Array3<u8>> {
        tokio::time::sleep(self.period).await;
        match &mut self.remaining {
            Some(0) => Err(PipelineError::stream_unavailable(&self.camera_id, "end of stream")),
            Some(n) => {
                *n -= 1;
                Ok(Array3::from_elem((120, 160, 3), 90u8))
            }
            None => Ok(Array3::from_elem((120, 160, 3), 90u8)),
        }
    }

    async fn close(&mut self) {}
}

fn camera() -> CameraConfig {
    let mut camera = CameraConfig {
        id: "lobby".to_string(),
        url: "scripted://lobby".to_string(),
        fps: 20.0,
        width: None,
        height: None,
        zones: vec![ZoneConfig {
            id: "door".to_string(),
            name: "Door".to_string(),
            role: ZoneRole::Monitored,
            polygon: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]],
            schedule: None,
        }],
        ..Default::default()
    };
    camera.overrides.intrusion_dwell_secs = Some(0.2);
    camera
}

struct Harness {
    supervisor: CameraSupervisor,
    validator: Arc<Validator>,
    delivery: Arc<DeliveryQueue>,
    notifier: Arc<RecordingNotifier>,
    bus: Arc<EventBus>,
    database: Database,
}

fn harness(config: Config, plan: Vec<Step>) -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let delivery = Arc::new(DeliveryQueue::new(
        Arc::new(MemoryOutbox::new()),
        notifier.clone(),
        DeliverySettings::from(&config.delivery),
    ));
    let validator = Arc::new(Validator::from_config(&config.validator, None));
    let bus = Arc::new(EventBus::new(1024));
    let database = Database::open_in_memory().unwrap();

    let services = Services::new(&config, Arc::new(StandingPerson), validator.clone(), delivery.clone(), bus.clone())
        .with_database(database.clone());

    let connector: Arc<dyn StreamConnector> = Arc::new(PacedConnector::new(plan));
    let connectors: ConnectorFactory = Arc::new(move |_: &CameraConfig| connector.clone());

    Harness {
        supervisor: CameraSupervisor::new(services, connectors),
        validator,
        delivery,
        notifier,
        bus,
        database,
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_intrusion_is_validated_and_delivered() {
    let h = harness(Config::default(), vec![]);
    let mut alerts = h.bus.subscribe_alerts();
    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = tokio::spawn(h.delivery.clone().run(shutdown_tx.subscribe()));

    h.supervisor.start_camera(camera()).unwrap();

    let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
        .await
        .expect("no alert in time")
        .unwrap();
    assert_eq!(alert.event_type, EventType::Intrusion);
    assert_eq!(alert.zone_id.as_deref(), Some("door"));
    assert!(alert.validator_score.unwrap() >= 0.7);

    assert!(wait_for(|| !h.notifier.sent.lock().is_empty()).await);
    let sent = h.notifier.sent.lock().clone();
    assert_eq!(sent[0].event_id, Some(alert.id));
    assert!(sent[0].subject.contains("intrusion"));
    assert!(sent[0].subject.contains("lobby"));

    // the person keeps standing there: still one intrusion
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.validator.counts()[&EventType::Intrusion].accepted, 1);

    let stored = h.database.get_event(alert.id).unwrap().unwrap();
    assert!(stored.accepted);

    let health = h.supervisor.health("lobby").unwrap();
    assert!(health.connected);
    assert!(health.frames_analyzed > 0);
    assert_eq!(health.candidates_accepted, 1);
    assert_eq!(health.alerts_queued, 1);

    h.supervisor.stop_all().await;
    let _ = shutdown_tx.send(());
    worker.await.unwrap();
}

#[tokio::test]
async fn test_rejected_candidates_never_reach_delivery() {
    let mut config = Config::default();
    config.validator.thresholds.intrusion = 0.99;
    let h = harness(config, vec![]);

    h.supervisor.start_camera(camera()).unwrap();

    assert!(wait_for(|| h.validator.counts()[&EventType::Intrusion].rejected >= 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let diag = h.supervisor.diagnostics();
    assert_eq!(diag.delivery.enqueued_total, 0);
    assert_eq!(diag.delivery.pending, 0);
    assert_eq!(diag.validation[&EventType::Intrusion].accepted, 0);
    assert_eq!(h.supervisor.health("lobby").unwrap().alerts_queued, 0);

    // rejected candidates are still recorded
    let events = h.database.recent_events(Some("lobby"), 10).unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| !e.accepted));

    h.supervisor.stop_all().await;
}

#[tokio::test]
async fn test_outage_reconnects_and_keeps_tracks() {
    let h = harness(Config::default(), vec![Step::Frames(30), Step::Refuse]);
    let mut events = h.bus.subscribe_events();

    h.supervisor.start_camera(camera()).unwrap();

    let mut statuses = Vec::new();
    let reconnected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if let PipelineEvent::Status { status, .. } = envelope.event {
                        statuses.push(status);
                        if statuses.len() == 3 {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await;
    assert!(reconnected.is_ok());
    assert_eq!(
        statuses,
        vec![StreamStatus::Connected, StreamStatus::Reconnecting, StreamStatus::Connected]
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = h.supervisor.health("lobby").unwrap();
    assert!(health.connected);
    assert_eq!(health.reconnects, 2);

    // a gap shorter than the inactivity limit keeps the track, so no second intrusion
    assert_eq!(h.validator.counts()[&EventType::Intrusion].accepted, 1);

    h.supervisor.stop_all().await;
    assert!(h.supervisor.health("lobby").is_none());
}

#[tokio::test]
async fn test_long_outage_evicts_tracks_and_reacquires() {
    let mut config = Config::default();
    config.tracker.max_inactive_age_secs = 0.5;
    config.events.sweep_interval_secs = 1;
    // refused twice: 1s + 2s of backoff, well past the inactivity limit
    let h = harness(config, vec![Step::Frames(30), Step::Refuse, Step::Refuse]);
    let mut alerts = h.bus.subscribe_alerts();

    h.supervisor.start_camera(camera()).unwrap();

    let mut received = Vec::new();
    let both = tokio::time::timeout(Duration::from_secs(15), async {
        while received.len() < 2 {
            match alerts.recv().await {
                Ok(alert) => received.push(alert),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("alert bus closed: {}", e),
            }
        }
    })
    .await;
    assert!(both.is_ok(), "expected a second intrusion after the outage");

    assert!(received.iter().all(|a| a.event_type == EventType::Intrusion));
    assert_ne!(received[0].track_id, received[1].track_id);
    assert_eq!(h.validator.counts()[&EventType::Intrusion].accepted, 2);

    let health = h.supervisor.health("lobby").unwrap();
    assert!(health.connected);
    assert!(health.tracks_evicted >= 1);
    assert!(health.reconnects >= 3);

    h.supervisor.stop_all().await;
}
