// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Delivery queue
//!
//! Accepted alerts are staged in memory, written to an outbox by a single
//! background worker, and delivered from there. Admission is decided against
//! an in-memory pending count so enqueueing never touches the store. Failed
//! sends are rescheduled on a fixed backoff schedule until the attempt budget
//! runs out, after which the message stays in the outbox as failed.

mod outbox;

pub use outbox::{MemoryOutbox, MessageStatus, OutboxStore, QueuedMessage, StatusCounts};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{PipelineError, Result};
use crate::notify::Notifier;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub capacity: usize,
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub interval: Duration,
    pub batch_size: usize,
    pub send_timeout: Duration,
    pub recipients: Vec<String>,
    pub drain_on_shutdown: bool,
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            interval: Duration::from_secs(config.worker_interval_secs.max(1)),
            batch_size: config.batch_size.max(1),
            send_timeout: Duration::from_secs(config.send_timeout_secs.max(1)),
            recipients: config.recipients.clone(),
            drain_on_shutdown: config.drain_on_shutdown,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

/// Result of one worker pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Snapshot of queue state for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryDiagnostics {
    pub notifier: String,
    pub durable: bool,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub enqueued_total: u64,
    pub rejected_full: u64,
    pub retries: u64,
    pub last_error: Option<String>,
    pub recent_failures: Vec<FailedMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMessage {
    pub id: Uuid,
    pub camera_id: String,
    pub subject: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// The delivery queue. One per process.
pub struct DeliveryQueue {
    store: Arc<dyn OutboxStore>,
    notifier: Arc<dyn Notifier>,
    settings: DeliverySettings,
    /// Accepted but not yet written to the store
    staged: Mutex<Vec<QueuedMessage>>,
    /// Staged plus pending in the store
    pending: AtomicUsize,
    wake: Notify,
    last_error: Mutex<Option<String>>,
    enqueued: AtomicU64,
    rejected_full: AtomicU64,
    retries: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn OutboxStore>, notifier: Arc<dyn Notifier>, settings: DeliverySettings) -> Self {
        let pending = match store.counts() {
            Ok(counts) => counts.pending,
            Err(e) => {
                error!("Failed to count pending outbox messages: {}", e);
                0
            }
        };
        if pending > 0 {
            info!("{} undelivered messages recovered from outbox", pending);
        }

        Self {
            store,
            notifier,
            settings,
            staged: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(pending),
            wake: Notify::new(),
            last_error: Mutex::new(None),
            enqueued: AtomicU64::new(0),
            rejected_full: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Add a message without waiting on delivery or storage. Fails with
    /// `QueueFull` when the pending count is at capacity; nothing already
    /// queued changes.
    pub fn enqueue(&self, mut message: QueuedMessage) -> Result<Uuid> {
        if message.recipients.is_empty() {
            message.recipients = self.settings.recipients.clone();
        }

        let capacity = self.settings.capacity;
        let admitted = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < capacity).then_some(n + 1))
            .is_ok();
        if !admitted {
            self.rejected_full.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::QueueFull { capacity });
        }

        let id = message.id;
        let camera_id = message.camera_id.clone();
        self.staged.lock().push(message);

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
        debug!(message_id = %id, camera_id = %camera_id, "Message queued");
        Ok(id)
    }

    /// Write staged messages to the store
    fn flush_staged(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        for message in staged {
            if let Err(e) = self.store.insert(&message) {
                self.release_slot();
                *self.last_error.lock() = Some(e.to_string());
                error!(message_id = %message.id, camera_id = %message.camera_id, "Failed to write message to outbox: {}", e);
            }
        }
    }

    fn release_slot(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let schedule = &self.settings.backoff;
        if schedule.is_empty() {
            return self.settings.interval;
        }
        let idx = (attempts.max(1) as usize - 1).min(schedule.len() - 1);
        schedule[idx]
    }

    /// Attempt every message due at `now`
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport> {
        self.flush_staged();
        let due = self.store.due(now, self.settings.batch_size)?;
        let mut report = DeliveryReport::default();
        for message in due {
            self.attempt(message, now, &mut report).await;
        }
        if report != DeliveryReport::default() {
            debug!(
                "Delivery pass: {} sent, {} retried, {} failed",
                report.sent, report.retried, report.failed
            );
        }
        Ok(report)
    }

    /// One attempt for every pending message regardless of schedule
    pub async fn drain(&self) -> Result<DeliveryReport> {
        self.flush_staged();
        let pending = self.store.pending(self.settings.capacity)?;
        let mut report = DeliveryReport::default();
        for message in pending {
            self.attempt(message, Utc::now(), &mut report).await;
        }
        Ok(report)
    }

    async fn attempt(&self, mut message: QueuedMessage, now: DateTime<Utc>, report: &mut DeliveryReport) {
        let outcome = match tokio::time::timeout(self.settings.send_timeout, self.notifier.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeliveryFailure(format!(
                "send timed out after {:?}",
                self.settings.send_timeout
            ))),
        };

        message.attempts += 1;
        message.updated_at = now;

        match outcome {
            Ok(()) => {
                message.status = MessageStatus::Sent;
                message.last_error = None;
                report.sent += 1;
                self.release_slot();
                info!(message_id = %message.id, camera_id = %message.camera_id, "Alert delivered via {}", self.notifier.name());
            }
            Err(e) => {
                let reason = e.to_string();
                *self.last_error.lock() = Some(reason.clone());
                message.last_error = Some(reason);

                if message.attempts >= self.settings.max_attempts || !e.is_transient() {
                    message.status = MessageStatus::Failed;
                    report.failed += 1;
                    self.release_slot();
                    error!(
                        message_id = %message.id,
                        camera_id = %message.camera_id,
                        "Delivery failed permanently after {} attempts: {}",
                        message.attempts,
                        e
                    );
                } else {
                    let delay = self.backoff_delay(message.attempts);
                    message.next_attempt_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    report.retried += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id = %message.id,
                        attempt = message.attempts,
                        "Delivery failed, retrying in {}s: {}",
                        delay.as_secs(),
                        e
                    );
                }
            }
        }

        if let Err(e) = self.store.update(&message) {
            error!(message_id = %message.id, "Failed to update outbox: {}", e);
        }
    }

    /// Background worker. Exits on shutdown; a non-durable outbox gets one
    /// final drain so in-flight alerts are not silently lost.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Delivery worker started ({} notifier, {} outbox)",
            self.notifier.name(),
            if self.store.is_durable() { "durable" } else { "in-memory" }
        );
        let mut ticker = tokio::time::interval(self.settings.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.recv() => break,
            }
            if let Err(e) = self.process_due(Utc::now()).await {
                error!("Delivery pass failed: {}", e);
            }
        }

        if self.store.is_durable() {
            self.flush_staged();
            let pending = self.depth();
            info!("Delivery worker stopped, {} messages kept in outbox", pending);
        } else if self.settings.drain_on_shutdown {
            match self.drain().await {
                Ok(report) => info!(
                    "Delivery worker drained on shutdown: {} sent, {} still undelivered",
                    report.sent,
                    report.retried + report.failed
                ),
                Err(e) => error!("Shutdown drain failed: {}", e),
            }
        }
    }

    /// Drop terminal messages older than `retention_days`
    pub fn purge(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        self.store.purge_terminal(cutoff)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        if let Some(staged) = self.staged.lock().iter().find(|m| m.id == id) {
            return Ok(Some(staged.clone()));
        }
        self.store.get(id)
    }

    /// Messages accepted and not yet sent or failed
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn diagnostics(&self) -> DeliveryDiagnostics {
        let counts = self.store.counts().unwrap_or_default();
        let recent_failures = self
            .store
            .failed(10)
            .unwrap_or_default()
            .into_iter()
            .map(|m| FailedMessage {
                id: m.id,
                camera_id: m.camera_id,
                subject: m.subject,
                attempts: m.attempts,
                last_error: m.last_error,
            })
            .collect();

        DeliveryDiagnostics {
            notifier: self.notifier.name().to_string(),
            durable: self.store.is_durable(),
            pending: self.depth(),
            sent: counts.sent,
            failed: counts.failed,
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            recent_failures,
        }
    }
}
