// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Per-camera health counters and copy-out snapshots

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::Frame;
use crate::stream::{DropOldestQueue, StreamHealth, StreamStatus};

/// Health of one camera at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct CameraHealth {
    pub camera_id: String,
    pub status: StreamStatus,
    pub connected: bool,
    pub fps: f64,
    pub detections_per_sec: f64,
    pub queue_depth: usize,
    pub frames_read: u64,
    pub frames_dropped: u64,
    pub frames_analyzed: u64,
    pub decode_errors: u64,
    pub inference_errors: u64,
    pub active_tracks: usize,
    /// Tracks dropped for inactivity since the analysis stage started
    pub tracks_evicted: u64,
    /// Objects currently watched for removal
    pub armed_objects: usize,
    pub reconnects: u64,
    pub stage_restarts: u64,
    pub candidates_accepted: u64,
    pub candidates_rejected: u64,
    pub alerts_queued: u64,
    pub alerts_dropped: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    frames: u64,
    detections: u64,
    fps: f64,
    detections_per_sec: f64,
}

/// Counters written by the pipeline stages, read by the health task
pub struct PipelineHealth {
    camera_id: String,
    queue: Arc<DropOldestQueue<Frame>>,
    reader: Mutex<watch::Receiver<StreamHealth>>,
    /// Frames and reconnects counted by reader generations that were replaced
    reader_frames_base: AtomicU64,
    reader_reconnects_base: AtomicU64,

    frames_analyzed: AtomicU64,
    detections: AtomicU64,
    inference_errors: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    alerts_queued: AtomicU64,
    alerts_dropped: AtomicU64,
    restarts: AtomicU64,
    active_tracks: AtomicUsize,
    tracks_evicted: AtomicU64,
    armed_objects: AtomicUsize,
    last_error: Mutex<Option<String>>,
    rates: Mutex<RateSample>,
}

impl PipelineHealth {
    pub fn new(camera_id: &str, queue: Arc<DropOldestQueue<Frame>>, reader: watch::Receiver<StreamHealth>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            queue,
            reader: Mutex::new(reader),
            reader_frames_base: AtomicU64::new(0),
            reader_reconnects_base: AtomicU64::new(0),
            frames_analyzed: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            inference_errors: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            alerts_queued: AtomicU64::new(0),
            alerts_dropped: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            active_tracks: AtomicUsize::new(0),
            tracks_evicted: AtomicU64::new(0),
            armed_objects: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            rates: Mutex::new(RateSample {
                at: Instant::now(),
                frames: 0,
                detections: 0,
                fps: 0.0,
                detections_per_sec: 0.0,
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Last reader state
    pub fn reader(&self) -> StreamHealth {
        self.reader.lock().borrow().clone()
    }

    /// Swap in the health channel of a restarted reader. Returns the next
    /// frame sequence and last timestamp so numbering continues.
    pub fn replace_reader(&self, reader: watch::Receiver<StreamHealth>) -> (u64, Option<DateTime<Utc>>) {
        let mut slot = self.reader.lock();
        let old = slot.borrow().clone();
        let frames = self.reader_frames_base.fetch_add(old.frames_read, Ordering::Relaxed) + old.frames_read;
        self.reader_reconnects_base.fetch_add(old.reconnect_count, Ordering::Relaxed);
        *slot = reader;
        (frames, old.last_frame_at)
    }

    /// `inference_errors` is the detector's running total
    pub fn record_frame(&self, detections: usize, active_tracks: usize, inference_errors: u64) {
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        self.detections.fetch_add(detections as u64, Ordering::Relaxed);
        self.active_tracks.store(active_tracks, Ordering::Relaxed);
        self.inference_errors.store(inference_errors, Ordering::Relaxed);
    }

    pub fn record_verdict(&self, accepted: bool) {
        let counter = if accepted { &self.accepted } else { &self.rejected };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self, queued: bool) {
        let counter = if queued { &self.alerts_queued } else { &self.alerts_dropped };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self, error: &str) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.set_error(error);
    }

    pub fn set_tracking(&self, active_tracks: usize, tracks_evicted: u64, armed_objects: usize) {
        self.active_tracks.store(active_tracks, Ordering::Relaxed);
        self.tracks_evicted.store(tracks_evicted, Ordering::Relaxed);
        self.armed_objects.store(armed_objects, Ordering::Relaxed);
    }

    pub fn set_error(&self, error: &str) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Recompute rates since the previous refresh and return a snapshot
    pub fn refresh(&self) -> CameraHealth {
        let frames = self.frames_analyzed.load(Ordering::Relaxed);
        let detections = self.detections.load(Ordering::Relaxed);
        let now = Instant::now();
        {
            let mut rates = self.rates.lock();
            let elapsed = now.duration_since(rates.at).as_secs_f64();
            if elapsed > 0.0 {
                rates.fps = frames.saturating_sub(rates.frames) as f64 / elapsed;
                rates.detections_per_sec = detections.saturating_sub(rates.detections) as f64 / elapsed;
            }
            rates.at = now;
            rates.frames = frames;
            rates.detections = detections;
        }
        self.snapshot()
    }

    /// Snapshot using the rates of the last refresh
    pub fn snapshot(&self) -> CameraHealth {
        let reader = self.reader();
        let rates = *self.rates.lock();
        let last_error = self.last_error.lock().clone().or(reader.last_error.clone());

        CameraHealth {
            camera_id: self.camera_id.clone(),
            status: reader.status,
            connected: reader.status == StreamStatus::Connected,
            fps: rates.fps,
            detections_per_sec: rates.detections_per_sec,
            queue_depth: self.queue.len(),
            frames_read: self.reader_frames_base.load(Ordering::Relaxed) + reader.frames_read,
            frames_dropped: self.queue.dropped(),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            decode_errors: reader.decode_errors,
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            active_tracks: self.active_tracks.load(Ordering::Relaxed),
            tracks_evicted: self.tracks_evicted.load(Ordering::Relaxed),
            armed_objects: self.armed_objects.load(Ordering::Relaxed),
            reconnects: self.reader_reconnects_base.load(Ordering::Relaxed) + reader.reconnect_count,
            stage_restarts: self.restarts.load(Ordering::Relaxed),
            candidates_accepted: self.accepted.load(Ordering::Relaxed),
            candidates_rejected: self.rejected.load(Ordering::Relaxed),
            alerts_queued: self.alerts_queued.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
            last_frame_at: reader.last_frame_at,
            last_error,
        }
    }
}
