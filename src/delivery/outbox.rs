// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Outbox storage for queued messages

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Lifecycle of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(PipelineError::Decode(format!("unknown message status '{}'", other))),
        }
    }
}

/// A notification waiting in the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub camera_id: String,
    pub subject: String,
    pub body: String,
    pub evidence_ref: Option<String>,
    pub recipients: Vec<String>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(camera_id: &str, subject: &str, body: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: None,
            camera_id: camera_id.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            evidence_ref: None,
            recipients: Vec::new(),
            attempts: 0,
            next_attempt_at: now,
            status: MessageStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Count of messages per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Where the delivery queue keeps its messages
pub trait OutboxStore: Send + Sync {
    fn insert(&self, message: &QueuedMessage) -> Result<()>;

    /// Overwrite a message's delivery state
    fn update(&self, message: &QueuedMessage) -> Result<()>;

    fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>>;

    /// Pending messages eligible at `now`, oldest first
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedMessage>>;

    /// Every pending message regardless of schedule
    fn pending(&self, limit: usize) -> Result<Vec<QueuedMessage>>;

    fn counts(&self) -> Result<StatusCounts>;

    /// Terminal-failed messages, newest first
    fn failed(&self, limit: usize) -> Result<Vec<QueuedMessage>>;

    /// Remove terminal messages last touched before `cutoff`
    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Survives a restart
    fn is_durable(&self) -> bool;
}

/// Process-local outbox
#[derive(Default)]
pub struct MemoryOutbox {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutboxStore for MemoryOutbox {
    fn insert(&self, message: &QueuedMessage) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    fn update(&self, message: &QueuedMessage) -> Result<()> {
        let mut messages = self.messages.lock();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(slot) => {
                *slot = message.clone();
                Ok(())
            }
            None => Err(PipelineError::DeliveryFailure(format!("message {} not in outbox", message.id))),
        }
    }

    fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        Ok(self.messages.lock().iter().find(|m| m.id == id).cloned())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedMessage>> {
        let mut due: Vec<QueuedMessage> = self
            .messages
            .lock()
            .iter()
            .filter(|m| m.status == MessageStatus::Pending && m.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|m| (m.next_attempt_at, m.created_at));
        due.truncate(limit);
        Ok(due)
    }

    fn pending(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for m in self.messages.lock().iter() {
            match m.status {
                MessageStatus::Pending => counts.pending += 1,
                MessageStatus::Sent => counts.sent += 1,
                MessageStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn failed(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        let mut failed: Vec<QueuedMessage> = self
            .messages
            .lock()
            .iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }

    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| !(m.status.is_terminal() && m.updated_at < cutoff));
        Ok(before - messages.len())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
