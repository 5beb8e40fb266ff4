// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! SentryLine - Edge Video Security Engine
//!
//! Turns live camera streams into validated security alerts:
//! - Resilient stream ingest with reconnect and stall detection
//! - Object detection behind a pluggable inference backend
//! - Multi-object tracking with persistent identities
//! - Zone-aware temporal rules (intrusion, loitering, crowding, removal)
//! - A validation gate between candidates and alerts
//! - Durable alert delivery with retry and backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── per camera ────────────────────────────┐
//! │  ┌────────┐  ┌─────────┐  ┌──────────┐  ┌─────────┐  ┌──────────┐  │
//! │  │ Stream │→ │ Sampler │→ │ Detector │→ │ Tracker │→ │  Event   │  │
//! │  │ Reader │  │         │  │          │  │         │  │  Engine  │  │
//! │  └────────┘  └─────────┘  └──────────┘  └─────────┘  └──────────┘  │
//! └────────────────────────────────────────────────────────│───────────┘
//!                                                          ↓
//!      ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!      │ Validator │ → │ Delivery │ → │ Notifier │   │ Database │
//!      │           │   │  Queue   │   │          │   │ Evidence │
//!      └───────────┘   └──────────┘   └──────────┘   └──────────┘
//! ```

pub mod core;
pub mod config;
pub mod error;
pub mod stream;
pub mod detection;
pub mod tracking;
pub mod events;
pub mod validation;
pub mod delivery;
pub mod notify;
pub mod evidence;
pub mod db;
pub mod supervisor;
pub mod demo;

// Re-exports for convenience
pub use config::Config;
pub use core::{BBox, Detection, EventBus, Frame};
pub use error::{PipelineError, Result};
pub use events::{EventCandidate, EventType};
pub use delivery::{DeliveryQueue, QueuedMessage};
pub use supervisor::{CameraHealth, CameraSupervisor, Services};
pub use db::Database;

/// SentryLine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// SentryLine name
pub const NAME: &str = "SentryLine";

/// Build info
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION.to_string(),
        target: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        features: enabled_features(),
    }
}

/// Build information
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Version string
    pub version: String,
    /// Target architecture
    pub target: String,
    /// Operating system
    pub os: String,
    /// Enabled features
    pub features: Vec<String>,
}

fn enabled_features() -> Vec<String> {
    let mut features = vec![];

    #[cfg(feature = "webhook")]
    features.push("webhook".to_string());

    #[cfg(feature = "mqtt")]
    features.push("mqtt".to_string());

    #[cfg(feature = "onnx")]
    features.push("onnx".to_string());

    features
}
