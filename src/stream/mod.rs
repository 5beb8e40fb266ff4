// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Stream ingest - one network video connection per camera
//!
//! The reader owns a connector, keeps a session open for as long as frames
//! keep arriving, and reconnects with exponential backoff otherwise. A
//! non-transient error parks the reader in `Failed` instead. Health is
//! published through a `watch` channel so observers never share flags with
//! the reconnect loop.

pub mod ffmpeg;
pub mod sampler;

pub use ffmpeg::FfmpegConnector;
pub use sampler::{DropOldestQueue, FrameSampler};

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::{EventBus, Frame};
use crate::error::{PipelineError, Result};

/// Opens sessions against one stream address
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, camera_id: &str) -> Result<Box<dyn StreamSession>>;
}

/// A live connection producing decoded RGB frames
#[async_trait]
pub trait StreamSession: Send {
    /// Next decoded frame.
    ///
    /// `Decode` skips the frame, `StreamUnavailable` ends the session.
    async fn next_frame(&mut self) -> Result<Array3<u8>>;

    /// Tear down the transport
    async fn close(&mut self);
}

/// Connection state of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Reconnecting,
    /// Gave up on an error retrying cannot fix
    Failed,
    Stopped,
}

/// Reader health record, copied out through the watch channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHealth {
    pub status: StreamStatus,
    pub reconnect_count: u64,
    pub frames_read: u64,
    pub decode_errors: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            status: StreamStatus::Connecting,
            reconnect_count: 0,
            frames_read: 0,
            decode_errors: 0,
            last_frame_at: None,
            last_error: None,
        }
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Reader tuning
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub stall_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

enum SessionEnd {
    Lost(PipelineError),
    Stopped,
}

/// Owns one camera connection and feeds the sampler
pub struct StreamReader {
    camera_id: String,
    connector: Arc<dyn StreamConnector>,
    settings: ReaderSettings,
    backoff: Backoff,
    health_tx: watch::Sender<StreamHealth>,
    event_bus: Arc<EventBus>,
    sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StreamReader {
    pub fn new(
        camera_id: &str,
        connector: Arc<dyn StreamConnector>,
        settings: ReaderSettings,
        event_bus: Arc<EventBus>,
    ) -> (Self, watch::Receiver<StreamHealth>) {
        let (health_tx, health_rx) = watch::channel(StreamHealth::default());
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        let reader = Self {
            camera_id: camera_id.to_string(),
            connector,
            settings,
            backoff,
            health_tx,
            event_bus,
            sequence: 0,
            last_timestamp: None,
        };
        (reader, health_rx)
    }

    /// Continue numbering after a restarted reader so frames stay ordered
    pub fn resume_from(mut self, sequence: u64, last_timestamp: Option<DateTime<Utc>>) -> Self {
        self.sequence = sequence;
        self.last_timestamp = last_timestamp;
        self
    }

    /// Read until `stop` flips to true. Transient stream errors are retried
    /// forever; anything else ends the reader in `Failed`.
    pub async fn run(mut self, mut sampler: FrameSampler, mut stop: watch::Receiver<bool>) {
        info!(camera_id = %self.camera_id, "Stream reader started");
        let mut failed = false;

        loop {
            if *stop.borrow() {
                break;
            }

            let connected = tokio::select! {
                res = self.connector.connect(&self.camera_id) => res,
                _ = stop.changed() => break,
            };

            let end = match connected {
                Ok(mut session) => {
                    debug!(camera_id = %self.camera_id, "Session opened");
                    let end = self.consume(session.as_mut(), &mut sampler, &mut stop).await;
                    session.close().await;
                    end
                }
                Err(e) => SessionEnd::Lost(e),
            };

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(e) if !e.is_transient() => {
                    error!(camera_id = %self.camera_id, code = e.code(), "Stream failed, not retrying: {}", e);
                    self.health_tx.send_modify(|h| h.last_error = Some(e.to_string()));
                    self.set_status(StreamStatus::Failed);
                    self.event_bus.publish_fault(&self.camera_id, e.code(), &e.to_string());
                    failed = true;
                    break;
                }
                SessionEnd::Lost(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        camera_id = %self.camera_id,
                        retry_in_secs = delay.as_secs_f32(),
                        "Stream lost: {}", e
                    );
                    self.health_tx.send_modify(|h| {
                        h.reconnect_count += 1;
                        h.last_error = Some(e.to_string());
                    });
                    self.set_status(StreamStatus::Reconnecting);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => break,
                    }
                }
            }
        }

        sampler.close();
        if !failed {
            self.set_status(StreamStatus::Stopped);
        }
        info!(camera_id = %self.camera_id, "Stream reader stopped");
    }

    async fn consume(
        &mut self,
        session: &mut dyn StreamSession,
        sampler: &mut FrameSampler,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut first = true;

        loop {
            let next = tokio::select! {
                res = tokio::time::timeout(self.settings.stall_timeout, session.next_frame()) => res,
                _ = stop.changed() => return SessionEnd::Stopped,
            };

            let image = match next {
                Err(_) => {
                    return SessionEnd::Lost(PipelineError::stream_unavailable(
                        &self.camera_id,
                        format!("no frame within {:?}", self.settings.stall_timeout),
                    ));
                }
                Ok(Err(PipelineError::Decode(msg))) => {
                    debug!(camera_id = %self.camera_id, "Skipping undecodable frame: {}", msg);
                    self.health_tx.send_modify(|h| h.decode_errors += 1);
                    continue;
                }
                Ok(Err(e)) => return SessionEnd::Lost(e),
                Ok(Ok(image)) => image,
            };

            if first {
                first = false;
                self.backoff.reset();
                self.set_status(StreamStatus::Connected);
                info!(camera_id = %self.camera_id, "Stream connected");
            }

            let captured_at = self.next_timestamp();
            let frame = Frame::new(&self.camera_id, self.sequence, captured_at, image);
            self.sequence += 1;

            self.health_tx.send_modify(|h| {
                h.frames_read += 1;
                h.last_frame_at = Some(captured_at);
            });

            sampler.offer(frame);
        }
    }

    /// Wall clock, forced strictly increasing
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn set_status(&self, status: StreamStatus) {
        let changed = self.health_tx.send_if_modified(|h| {
            if h.status == status {
                false
            } else {
                h.status = status;
                true
            }
        });
        if changed {
            self.event_bus.publish_status(&self.camera_id, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineEvent;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted session results; an empty script means the stream hangs
    struct ScriptedSession {
        script: VecDeque<Result<Array3<u8>>>,
    }

    #[async_trait]
    impl StreamSession for ScriptedSession {
        async fn next_frame(&mut self) -> Result<Array3<u8>> {
            match self.script.pop_front() {
                Some(item) => item,
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn close(&mut self) {}
    }

    struct ScriptedConnector {
        sessions: Mutex<VecDeque<Result<Vec<Result<Array3<u8>>>>>>,
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self, camera_id: &str) -> Result<Box<dyn StreamSession>> {
            *self.attempts.lock() += 1;
            match self.sessions.lock().pop_front() {
                Some(Ok(frames)) => Ok(Box::new(ScriptedSession {
                    script: frames.into_iter().collect(),
                })),
                Some(Err(e)) => Err(e),
                None => Err(PipelineError::stream_unavailable(camera_id, "refused")),
            }
        }
    }

    fn image() -> Array3<u8> {
        Array3::zeros((4, 4, 3))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_stall_and_resets_backoff() {
        let connector = Arc::new(ScriptedConnector {
            sessions: Mutex::new(VecDeque::from(vec![
                Ok(vec![Ok(image()), Ok(image())]),
                Err(PipelineError::stream_unavailable("cam", "refused")),
                Ok(vec![Err(PipelineError::Decode("bad".into())), Ok(image())]),
            ])),
            attempts: Mutex::new(0),
        });
        let settings = ReaderSettings {
            stall_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let bus = Arc::new(EventBus::new(16));
        let (reader, mut health) = StreamReader::new("cam", connector.clone(), settings, bus);
        let queue = Arc::new(DropOldestQueue::new(16));
        let sampler = FrameSampler::new(0.0, queue.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(reader.run(sampler, stop_rx));

        // first session: two frames then stall
        let f0 = queue.pop().await.unwrap();
        let f1 = queue.pop().await.unwrap();
        assert_eq!((f0.sequence, f1.sequence), (0, 1));
        assert!(f1.captured_at > f0.captured_at);

        // stall -> reconnect refused -> third session delivers after decode skip
        let f2 = queue.pop().await.unwrap();
        assert_eq!(f2.sequence, 2);

        health.changed().await.ok();
        let snapshot = health.borrow().clone();
        assert_eq!(snapshot.status, StreamStatus::Connected);
        assert_eq!(snapshot.reconnect_count, 2);
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(*connector.attempts.lock(), 3);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(health.borrow().status, StreamStatus::Stopped);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_without_retry() {
        let connector = Arc::new(ScriptedConnector {
            sessions: Mutex::new(VecDeque::from(vec![
                Ok(vec![Ok(image())]),
                Err(PipelineError::Configuration("unsupported scheme".into())),
            ])),
            attempts: Mutex::new(0),
        });
        let bus = Arc::new(EventBus::new(16));
        let mut faults = bus.subscribe_events();
        let (reader, health) = StreamReader::new("cam", connector.clone(), ReaderSettings::default(), bus);
        let queue = Arc::new(DropOldestQueue::new(4));
        let (_stop_tx, stop_rx) = watch::channel(false);

        // first session stalls, the reconnect hits the permanent error
        reader.run(FrameSampler::new(0.0, queue.clone()), stop_rx).await;

        let snapshot = health.borrow().clone();
        assert_eq!(snapshot.status, StreamStatus::Failed);
        assert!(snapshot.last_error.unwrap().contains("unsupported scheme"));
        assert_eq!(*connector.attempts.lock(), 2);
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());

        let mut fault_seen = false;
        while let Ok(envelope) = faults.try_recv() {
            if let PipelineEvent::Fault { code, .. } = envelope.event {
                fault_seen |= code == "CONFIGURATION_ERROR";
            }
        }
        assert!(fault_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_camera_keeps_reconnecting() {
        let connector = Arc::new(ScriptedConnector {
            sessions: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(0),
        });
        let bus = Arc::new(EventBus::new(16));
        let (reader, health) = StreamReader::new("cam", connector.clone(), ReaderSettings::default(), bus);
        let queue = Arc::new(DropOldestQueue::new(2));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(FrameSampler::new(5.0, queue), stop_rx));

        // 1 + 2 + 4 + 8 + 16 + 32 + 60 seconds of backoff
        tokio::time::sleep(Duration::from_secs(124)).await;
        assert_eq!(health.borrow().status, StreamStatus::Reconnecting);
        assert_eq!(*connector.attempts.lock(), 8);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
