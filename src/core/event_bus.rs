// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Event bus for observers of the camera pipelines

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use serde::Serialize;
use chrono::{DateTime, Utc};

use crate::events::EventCandidate;
use crate::stream::StreamStatus;

/// What happened
#[derive(Debug, Clone, Serialize)]
pub enum PipelineEvent {
    /// A candidate went through the validator gate
    Verdict { candidate: EventCandidate, accepted: bool },
    /// A reader changed connection state
    Status { camera_id: String, status: StreamStatus },
    /// A stage failed and was restarted
    Fault { camera_id: String, code: String, message: String },
}

/// Bus envelope
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub event: PipelineEvent,
}

/// Fan-out of pipeline events; a lagging subscriber loses the oldest entries
pub struct EventBus {
    candidate_tx: broadcast::Sender<EventCandidate>,
    event_tx: broadcast::Sender<Envelope>,
    event_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (candidate_tx, _) = broadcast::channel(capacity.max(1));
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            candidate_tx,
            event_tx,
            event_counter: AtomicU64::new(0),
        }
    }

    pub fn publish_verdict(&self, candidate: &EventCandidate, accepted: bool) {
        if accepted {
            let _ = self.candidate_tx.send(candidate.clone());
        }
        self.publish(PipelineEvent::Verdict {
            candidate: candidate.clone(),
            accepted,
        });
    }

    pub fn publish_status(&self, camera_id: &str, status: StreamStatus) {
        self.publish(PipelineEvent::Status {
            camera_id: camera_id.to_string(),
            status,
        });
    }

    pub fn publish_fault(&self, camera_id: &str, code: &str, message: &str) {
        self.publish(PipelineEvent::Fault {
            camera_id: camera_id.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    fn publish(&self, event: PipelineEvent) {
        let id = self.event_counter.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_tx.send(Envelope {
            id,
            timestamp: Utc::now(),
            event,
        });
    }

    /// Accepted candidates only
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<EventCandidate> {
        self.candidate_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.event_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCandidate, EventType};

    #[tokio::test]
    async fn test_rejected_candidates_not_on_alert_channel() {
        let bus = EventBus::new(8);
        let mut alerts = bus.subscribe_alerts();
        let mut events = bus.subscribe_events();

        let candidate = EventCandidate::new(EventType::Intrusion, "cam", 1, Some("door".into()), 0.5, Utc::now());
        bus.publish_verdict(&candidate, false);
        bus.publish_verdict(&candidate, true);

        let first = events.recv().await.unwrap();
        assert_eq!(first.id, 0);
        assert!(matches!(first.event, PipelineEvent::Verdict { accepted: false, .. }));

        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.id, candidate.id);
        assert!(alerts.try_recv().is_err());
    }
}
