// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Detection module - object detection on sampled frames

mod nms;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod yolo;

pub use nms::classwise_nms;
pub use yolo::{TensorModel, YoloBackend, COCO_LABELS};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use ndarray::Array3;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::core::{Detection, Frame};
use crate::error::{PipelineError, Result};

/// Runtime producing raw, unsuppressed detections for an RGB image.
///
/// Implementations are shared read-only between cameras and are called
/// from the blocking pool.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, image: &Array3<u8>) -> Result<Vec<Detection>>;
}

/// Detector settings
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Labels to keep; empty keeps everything
    pub classes: HashSet<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            max_detections: 300,
            classes: HashSet::new(),
        }
    }
}

impl From<&DetectorConfig> for DetectorSettings {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
            classes: config.classes_of_interest.iter().cloned().collect(),
        }
    }
}

/// Runs the backend, filters and deduplicates its output
pub struct Detector {
    backend: Arc<dyn InferenceBackend>,
    settings: DetectorSettings,
    frames: AtomicU64,
    inference_errors: AtomicU64,
    rejected_frames: AtomicU64,
}

impl Detector {
    pub fn new(backend: Arc<dyn InferenceBackend>, settings: DetectorSettings) -> Self {
        Self {
            backend,
            settings,
            frames: AtomicU64::new(0),
            inference_errors: AtomicU64::new(0),
            rejected_frames: AtomicU64::new(0),
        }
    }

    /// Detect objects; a malformed frame or a failing model yields nothing
    pub fn detect(&self, frame: &Frame) -> Vec<Detection> {
        match self.try_detect(frame) {
            Ok(detections) => detections,
            Err(e @ PipelineError::Decode(_)) => {
                self.rejected_frames.fetch_add(1, Ordering::Relaxed);
                warn!(camera_id = %frame.camera_id, sequence = frame.sequence, "{}", e);
                Vec::new()
            }
            Err(e) => {
                self.inference_errors.fetch_add(1, Ordering::Relaxed);
                debug!(camera_id = %frame.camera_id, sequence = frame.sequence, "{}", e);
                Vec::new()
            }
        }
    }

    pub fn try_detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        self.frames.fetch_add(1, Ordering::Relaxed);

        if !frame.is_well_formed() {
            return Err(PipelineError::Decode(format!(
                "malformed frame shape {:?}",
                frame.image.dim()
            )));
        }

        let raw = self.backend.infer(&frame.image)?;
        let (w, h) = (frame.width() as f32, frame.height() as f32);

        let filtered: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence.is_finite() && d.confidence >= self.settings.confidence_threshold)
            .filter(|d| self.settings.classes.is_empty() || self.settings.classes.contains(&d.class_label))
            .filter(|d| d.bbox.is_finite())
            .map(|mut d| {
                d.bbox = d.bbox.clamp(w, h);
                d
            })
            .filter(|d| d.bbox.area() > 0.0)
            .collect();

        Ok(classwise_nms(
            filtered,
            self.settings.iou_threshold,
            self.settings.max_detections,
        ))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn inference_errors(&self) -> u64 {
        self.inference_errors.load(Ordering::Relaxed)
    }

    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames.load(Ordering::Relaxed)
    }
}

/// YOLO backend over the configured model file
pub fn model_backend(config: &DetectorConfig) -> Result<Arc<dyn InferenceBackend>> {
    let Some(path) = config.model_path.as_deref() else {
        return Err(PipelineError::Configuration(
            "detector.model_path is required unless running in demo mode".into(),
        ));
    };
    load_model(config, path)
}

#[cfg(feature = "onnx")]
fn load_model(config: &DetectorConfig, path: &std::path::Path) -> Result<Arc<dyn InferenceBackend>> {
    let classes = if config.labels.is_empty() {
        COCO_LABELS.len()
    } else {
        config.labels.len()
    };
    let model = onnx::OnnxDetector::load(path, config.input_size, classes)?;
    Ok(Arc::new(YoloBackend::new(
        Arc::new(model),
        config.labels.clone(),
        config.confidence_threshold,
    )))
}

#[cfg(not(feature = "onnx"))]
fn load_model(_config: &DetectorConfig, path: &std::path::Path) -> Result<Arc<dyn InferenceBackend>> {
    Err(PipelineError::Configuration(format!(
        "cannot load {:?}: built without the onnx feature",
        path
    )))
}
