// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Pipeline error taxonomy

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised inside a camera pipeline or the delivery queue
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Connection lost, connect failed, or no frame within the stall timeout
    #[error("Stream unavailable for camera {camera_id}: {reason}")]
    StreamUnavailable { camera_id: String, reason: String },

    /// A single frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The detection model failed on a single frame
    #[error("Inference error: {0}")]
    Inference(String),

    /// Delivery queue is at its capacity ceiling
    #[error("Delivery queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The notifier refused or failed to deliver a message
    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    /// Zone, schedule or camera configuration is malformed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistent store failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn stream_unavailable(camera_id: &str, reason: impl Into<String>) -> Self {
        Self::StreamUnavailable {
            camera_id: camera_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Transient errors are retried or skipped by the stage that raised them
    /// and never escalate to the supervisor.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StreamUnavailable { .. }
                | Self::Decode(_)
                | Self::Inference(_)
                | Self::QueueFull { .. }
                | Self::DeliveryFailure(_)
        )
    }

    /// Short stable code used in diagnostics and logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::StreamUnavailable { .. } => "STREAM_UNAVAILABLE",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Inference(_) => "INFERENCE_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::DeliveryFailure(_) => "DELIVERY_FAILURE",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::stream_unavailable("cam-1", "eof").is_transient());
        assert!(PipelineError::QueueFull { capacity: 10 }.is_transient());
        assert!(!PipelineError::Configuration("bad zone".into()).is_transient());
    }

    #[test]
    fn test_display_includes_camera() {
        let err = PipelineError::stream_unavailable("lobby", "stall");
        assert_eq!(err.to_string(), "Stream unavailable for camera lobby: stall");
        assert_eq!(err.code(), "STREAM_UNAVAILABLE");
    }
}
