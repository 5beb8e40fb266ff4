// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! One camera's chain of stages
//!
//! reader -> sampler -> [drop-oldest queue] -> analysis
//!
//! The analysis task owns the tracker and event engine. Detection and
//! validation run on the blocking pool; a panic there costs one frame or one
//! candidate and leaves track state alone. A panic inside the analysis task
//! itself means tracker and engine state can no longer be trusted, so the
//! task is rebuilt from scratch. A reader panic restarts only the reader,
//! continuing its frame numbering.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::health::PipelineHealth;
use super::Services;
use crate::config::EventConfig;
use crate::core::Frame;
use crate::delivery::QueuedMessage;
use crate::detection::Detector;
use crate::events::{EventCandidate, EventEngine, Zone};
use crate::notify;
use crate::stream::{DropOldestQueue, FrameSampler, ReaderSettings, StreamConnector, StreamReader};
use crate::tracking::Tracker;

const RESTART_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a camera's stages share. Read-only apart from the counters.
pub(crate) struct PipelineContext {
    pub camera_id: String,
    pub fps: f64,
    pub zones: Arc<Vec<Zone>>,
    pub events: EventConfig,
    pub connector: Arc<dyn StreamConnector>,
    pub reader_settings: ReaderSettings,
    pub detector: Arc<Detector>,
    pub queue: Arc<DropOldestQueue<Frame>>,
    pub health: Arc<PipelineHealth>,
    pub services: Services,
}

impl PipelineContext {
    fn fault(&self, code: &str, message: &str) {
        error!(camera_id = %self.camera_id, code, "{}", message);
        self.health.record_restart(message);
        self.services.event_bus.publish_fault(&self.camera_id, code, message);
    }
}

/// Run until `stop` flips, restarting stages that die
pub(crate) async fn run(ctx: Arc<PipelineContext>, first_reader: StreamReader, mut stop: watch::Receiver<bool>) {
    let mut reader = spawn_reader(&ctx, first_reader, stop.clone());
    let mut analysis = spawn_analysis(&ctx, stop.clone());
    let (mut reader_done, mut analysis_done) = (false, false);

    loop {
        tokio::select! {
            res = &mut reader, if !reader_done => {
                reader_done = true;
                if let Err(e) = res {
                    if e.is_panic() && !*stop.borrow() {
                        ctx.fault("READER_FAULT", &format!("stream reader crashed: {}", e));
                        if !pause(&mut stop).await {
                            break;
                        }
                        let (fresh, health_rx) = StreamReader::new(
                            &ctx.camera_id,
                            ctx.connector.clone(),
                            ctx.reader_settings.clone(),
                            ctx.services.event_bus.clone(),
                        );
                        let (sequence, last_ts) = ctx.health.replace_reader(health_rx);
                        reader = spawn_reader(&ctx, fresh.resume_from(sequence, last_ts), stop.clone());
                        reader_done = false;
                        info!(camera_id = %ctx.camera_id, "Stream reader restarted at frame {}", sequence);
                    }
                }
            }
            res = &mut analysis, if !analysis_done => {
                analysis_done = true;
                if let Err(e) = res {
                    if e.is_panic() && !*stop.borrow() {
                        ctx.fault("ANALYSIS_FAULT", &format!("tracker/event stage crashed, state reset: {}", e));
                        if !pause(&mut stop).await {
                            break;
                        }
                        ctx.health.set_tracking(0, 0, 0);
                        analysis = spawn_analysis(&ctx, stop.clone());
                        analysis_done = false;
                        info!(camera_id = %ctx.camera_id, "Analysis restarted with fresh track state");
                    }
                }
            }
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }
        }

        if reader_done && analysis_done {
            break;
        }
    }

    ctx.queue.close();
    for (name, handle, done) in [("reader", &mut reader, reader_done), ("analysis", &mut analysis, analysis_done)] {
        if done {
            continue;
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut *handle).await.is_err() {
            warn!(camera_id = %ctx.camera_id, "{} did not stop in time, aborting", name);
            handle.abort();
        }
    }
    debug!(camera_id = %ctx.camera_id, "Pipeline finished");
}

/// Wait before a restart. False when stopped meanwhile.
async fn pause(stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RESTART_DELAY) => !*stop.borrow(),
        res = stop.changed() => res.is_ok() && !*stop.borrow(),
    }
}

fn spawn_reader(ctx: &Arc<PipelineContext>, reader: StreamReader, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    ctx.queue.reopen();
    let sampler = FrameSampler::new(ctx.fps, ctx.queue.clone());
    tokio::spawn(reader.run(sampler, stop))
}

fn spawn_analysis(ctx: &Arc<PipelineContext>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    let analysis = Analysis {
        ctx: ctx.clone(),
        tracker: Tracker::new(ctx.services.tracker.clone()),
        engine: EventEngine::new(&ctx.camera_id, ctx.events.clone(), ctx.zones.clone()),
    };
    tokio::spawn(analysis.run(stop))
}

/// Detection, tracking, temporal rules, validation and hand-off to delivery
struct Analysis {
    ctx: Arc<PipelineContext>,
    tracker: Tracker,
    engine: EventEngine,
}

impl Analysis {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut sweep = interval(Duration::from_secs(self.ctx.events.sweep_interval_secs.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            let frame = tokio::select! {
                frame = self.ctx.queue.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep();
                    continue;
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.process(frame).await;
        }

        debug!(camera_id = %self.ctx.camera_id, "Analysis stopped, {} tracks released", self.tracker.len());
    }

    /// Keeps state bounded while the stream is down
    fn sweep(&mut self) {
        let now = Utc::now();
        let evicted = self.tracker.evict_stale(now);
        let purged = self.engine.sweep(now);
        self.update_gauges();
        if !evicted.is_empty() || purged > 0 {
            debug!(
                camera_id = %self.ctx.camera_id,
                "Swept {} stale tracks and {} state entries",
                evicted.len(),
                purged
            );
        }
    }

    fn update_gauges(&self) {
        self.ctx.health.set_tracking(
            self.tracker.len(),
            self.tracker.evicted_count(),
            self.engine.armed_objects(),
        );
    }

    async fn process(&mut self, frame: Frame) {
        let detector = self.ctx.detector.clone();
        let input = frame.clone();
        let detections = match tokio::task::spawn_blocking(move || detector.detect(&input)).await {
            Ok(detections) => detections,
            Err(e) => {
                self.ctx
                    .fault("DETECTOR_FAULT", &format!("detector crashed on frame {}: {}", frame.sequence, e));
                return;
            }
        };

        let now = frame.captured_at;
        let tracks = self.tracker.update(frame.sequence, &detections, now);
        let candidates = self.engine.process(&tracks, frame.sequence, now);
        self.ctx
            .health
            .record_frame(detections.len(), self.tracker.len(), self.ctx.detector.inference_errors());
        self.update_gauges();

        for candidate in candidates {
            self.handle_candidate(candidate, &frame).await;
        }
    }

    /// Validator gate, persistence, evidence, delivery. Nothing reaches the
    /// delivery queue without an accepted verdict.
    async fn handle_candidate(&self, candidate: EventCandidate, frame: &Frame) {
        let services = &self.ctx.services;

        let validator = services.validator.clone();
        let (c, f) = (candidate.clone(), frame.clone());
        let verdict = match tokio::task::spawn_blocking(move || validator.validate(&c, Some(&f))).await {
            Ok(verdict) => verdict,
            Err(e) => {
                self.ctx
                    .fault("VALIDATOR_FAULT", &format!("validator crashed on {}: {}", candidate.id, e));
                return;
            }
        };

        let candidate = candidate.with_score(verdict.score);
        self.ctx.health.record_verdict(verdict.accepted);

        let evidence_ref = {
            let services = services.clone();
            let (c, f) = (candidate.clone(), frame.clone());
            let accepted = verdict.accepted;
            tokio::task::spawn_blocking(move || persist(&services, &c, &f, accepted))
                .await
                .unwrap_or(None)
        };

        services.event_bus.publish_verdict(&candidate, verdict.accepted);

        if !verdict.accepted {
            debug!(
                camera_id = %candidate.camera_id,
                event_type = %candidate.event_type,
                score = verdict.score,
                "Candidate rejected"
            );
            return;
        }

        info!(
            camera_id = %candidate.camera_id,
            event_type = %candidate.event_type,
            track_id = candidate.track_id,
            score = verdict.score,
            "Event accepted"
        );

        let mut message = QueuedMessage::new(
            &candidate.camera_id,
            &notify::subject(&candidate),
            &notify::body(&candidate, evidence_ref.as_deref()),
            Utc::now(),
        );
        message.event_id = Some(candidate.id);
        message.evidence_ref = evidence_ref;

        match services.delivery.enqueue(message) {
            Ok(_) => self.ctx.health.record_alert(true),
            Err(e) => {
                warn!(camera_id = %candidate.camera_id, event_id = %candidate.id, "Alert dropped: {}", e);
                self.ctx.health.record_alert(false);
                self.ctx.health.set_error(&e.to_string());
            }
        }
    }
}

/// Evidence for accepted candidates, then the event row. Returns the
/// evidence reference.
fn persist(services: &Services, candidate: &EventCandidate, frame: &Frame, accepted: bool) -> Option<String> {
    let evidence_ref = match (&services.evidence, accepted) {
        (Some(sink), true) => match sink.store(candidate, frame) {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!(event_id = %candidate.id, "Evidence not saved: {}", e);
                None
            }
        },
        _ => None,
    };

    if let Some(db) = &services.database {
        if let Err(e) = db.record_event(candidate, accepted, candidate.validator_score.unwrap_or(0.0), evidence_ref.as_deref()) {
            error!(event_id = %candidate.id, "Failed to record event: {}", e);
        }
    }

    evidence_ref
}
