// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Outbound notifiers and alert formatting

#[cfg(feature = "mqtt")]
mod mqtt;
#[cfg(feature = "webhook")]
mod webhook;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttNotifier;
#[cfg(feature = "webhook")]
pub use webhook::WebhookNotifier;

use std::fmt::Write as _;
use std::sync::Arc;
use async_trait::async_trait;
use tracing::info;

use crate::config::{NotifierConfig, NotifierKind};
use crate::delivery::QueuedMessage;
use crate::error::Result;
use crate::events::EventCandidate;

/// External delivery channel used by the delivery worker
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one message. Any error is treated as a failed attempt.
    async fn send(&self, message: &QueuedMessage) -> Result<()>;
}

/// Writes alerts to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &QueuedMessage) -> Result<()> {
        info!(
            camera_id = %message.camera_id,
            message_id = %message.id,
            attempt = message.attempts + 1,
            "ALERT {}",
            message.subject
        );
        Ok(())
    }
}

/// Build the notifier selected in config
pub fn build_notifier(config: &NotifierConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match config.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        #[cfg(feature = "webhook")]
        NotifierKind::Webhook => Ok(Arc::new(WebhookNotifier::new(config)?)),
        #[cfg(feature = "mqtt")]
        NotifierKind::Mqtt => Ok(Arc::new(MqttNotifier::new(config)?)),
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("notifier {:?} not compiled in", other),
    }
}

/// `[SEVERITY] event_type - camera - timestamp`
pub fn subject(candidate: &EventCandidate) -> String {
    format!(
        "[{}] {} - {} - {}",
        candidate.severity.to_string().to_uppercase(),
        candidate.event_type,
        candidate.camera_id,
        candidate.timestamp.format("%Y-%m-%d %H:%M:%S")
    )
}

/// One-line human description, e.g. "Loitering detected (duration: 65.0s)"
pub fn describe(candidate: &EventCandidate) -> String {
    let kind = candidate.event_type.as_str().replace('_', " ");
    let mut chars = kind.chars();
    let mut text = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    text.push_str(" detected");

    let meta = &candidate.metadata;
    if let Some(d) = meta.get("duration_secs").and_then(|v| v.as_f64()) {
        let _ = write!(text, " (duration: {:.1}s)", d);
    } else if let Some(d) = meta.get("dwell_secs").and_then(|v| v.as_f64()) {
        let _ = write!(text, " (dwell time: {:.1}s)", d);
    } else if let Some(n) = meta.get("person_count").and_then(|v| v.as_u64()) {
        let _ = write!(text, " ({} people)", n);
    } else if let Some(class) = meta.get("object_class").and_then(|v| v.as_str()) {
        let _ = write!(text, " ({} removed)", class);
    }
    text
}

/// Plain-text body listing the event details and metadata
pub fn body(candidate: &EventCandidate, evidence_ref: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Event Type: {}", candidate.event_type);
    let _ = writeln!(out, "Severity: {}", candidate.severity.to_string().to_uppercase());
    let _ = writeln!(out, "Timestamp: {}", candidate.timestamp.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Description: {}", describe(candidate));
    let _ = writeln!(out, "Camera ID: {}", candidate.camera_id);
    let _ = writeln!(out, "Track ID: {}", candidate.track_id);
    if let Some(zone) = &candidate.zone_id {
        let _ = writeln!(out, "Zone: {}", zone);
    }
    let _ = writeln!(out, "Confidence: {:.2}", candidate.confidence);
    if let Some(score) = candidate.validator_score {
        let _ = writeln!(out, "Validator Score: {:.2}", score);
    }
    if let Some(evidence) = evidence_ref {
        let _ = writeln!(out, "Evidence: {}", evidence);
    }
    for (key, value) in &candidate.metadata {
        let _ = writeln!(out, "  {}: {}", key, value);
    }
    out
}
