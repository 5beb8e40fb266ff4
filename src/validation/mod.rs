// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Validation gate between event candidates and alerts

#[cfg(feature = "onnx")]
pub mod onnx;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use ndarray::{Array4, ArrayView3};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PerEventType, ValidatorConfig};
use crate::core::Frame;
use crate::error::{PipelineError, Result};
use crate::events::{EventCandidate, EventType};

/// Secondary model scoring an evidence crop in `[0, 1]`
pub trait EvidenceClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, event_type: EventType, crop: ArrayView3<'_, u8>) -> Result<f32>;
}

/// Produces the score compared against the per-type threshold
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, candidate: &EventCandidate, evidence: Option<&Frame>) -> f32;
}

/// Raw confidence discounted by a per-type factor
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    factors: PerEventType,
}

impl HeuristicScorer {
    pub fn new(factors: PerEventType) -> Self {
        Self { factors }
    }
}

impl Scorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn score(&self, candidate: &EventCandidate, _evidence: Option<&Frame>) -> f32 {
        (candidate.confidence * self.factors.get(candidate.event_type)).clamp(0.0, 1.0)
    }
}

/// Runs the classifier on the padded candidate box; falls back to the
/// heuristic when there is no evidence or the model fails.
pub struct ModelScorer {
    classifier: Arc<dyn EvidenceClassifier>,
    fallback: HeuristicScorer,
    padding: f32,
}

impl ModelScorer {
    pub fn new(classifier: Arc<dyn EvidenceClassifier>, fallback: HeuristicScorer, padding: f32) -> Self {
        Self {
            classifier,
            fallback,
            padding,
        }
    }
}

impl Scorer for ModelScorer {
    fn name(&self) -> &str {
        self.classifier.name()
    }

    fn score(&self, candidate: &EventCandidate, evidence: Option<&Frame>) -> f32 {
        let crop = match (evidence, candidate.bbox) {
            (Some(frame), Some(bbox)) => frame.crop(&bbox.pad(self.padding)),
            (Some(frame), None) => Some(frame.image.view()),
            _ => None,
        };

        let Some(crop) = crop else {
            debug!(event_id = %candidate.id, "No evidence crop, using heuristic");
            return self.fallback.score(candidate, evidence);
        };

        match self.classifier.classify(candidate.event_type, crop) {
            Ok(score) if score.is_finite() => score.clamp(0.0, 1.0),
            Ok(score) => {
                warn!(event_id = %candidate.id, "Classifier returned {}, using heuristic", score);
                self.fallback.score(candidate, evidence)
            }
            Err(e) => {
                warn!(event_id = %candidate.id, "Classifier failed, using heuristic: {}", e);
                self.fallback.score(candidate, evidence)
            }
        }
    }
}

/// Nearest-neighbour resize of a crop into a `[1, 3, size, size]` tensor in `[0, 1]`
pub fn crop_tensor(crop: ArrayView3<'_, u8>, size: usize) -> Result<Array4<f32>> {
    let (h, w, channels) = crop.dim();
    if h == 0 || w == 0 || channels < 3 || size == 0 {
        return Err(PipelineError::Decode(format!("cannot scale a {}x{}x{} crop", h, w, channels)));
    }
    let mut tensor = Array4::zeros((1, 3, size, size));
    for y in 0..size {
        let sy = y * h / size;
        for x in 0..size {
            let sx = x * w / size;
            for c in 0..3 {
                tensor[[0, c, y, x]] = crop[[sy, sx, c]] as f32 / 255.0;
            }
        }
    }
    Ok(tensor)
}

/// Classifier for the configured model file, if any
pub fn evidence_classifier(config: &ValidatorConfig) -> Result<Option<Arc<dyn EvidenceClassifier>>> {
    match config.model_path.as_deref() {
        None => Ok(None),
        Some(path) => load_classifier(config, path).map(Some),
    }
}

#[cfg(feature = "onnx")]
fn load_classifier(config: &ValidatorConfig, path: &std::path::Path) -> Result<Arc<dyn EvidenceClassifier>> {
    Ok(Arc::new(onnx::OnnxClassifier::load(path, config.model_input_size)?))
}

#[cfg(not(feature = "onnx"))]
fn load_classifier(_config: &ValidatorConfig, path: &std::path::Path) -> Result<Arc<dyn EvidenceClassifier>> {
    Err(PipelineError::Configuration(format!(
        "cannot load {:?}: built without the onnx feature",
        path
    )))
}

/// Outcome of the gate
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    pub accepted: bool,
    pub score: f32,
}

/// Accept/reject counts for one event type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateCounts {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// The validator. Shared by every camera.
pub struct Validator {
    scorer: Arc<dyn Scorer>,
    thresholds: PerEventType,
    counters: [Counters; 4],
}

impl Validator {
    pub fn new(scorer: Arc<dyn Scorer>, thresholds: PerEventType) -> Self {
        Self {
            scorer,
            thresholds,
            counters: Default::default(),
        }
    }

    /// Pick model or heuristic scoring once, at startup
    pub fn from_config(config: &ValidatorConfig, classifier: Option<Arc<dyn EvidenceClassifier>>) -> Self {
        let heuristic = HeuristicScorer::new(config.factors);
        let scorer: Arc<dyn Scorer> = match classifier {
            Some(classifier) => Arc::new(ModelScorer::new(classifier, heuristic, config.crop_padding)),
            None => Arc::new(heuristic),
        };
        info!("Validator using {} scorer", scorer.name());
        Self::new(scorer, config.thresholds)
    }

    pub fn validate(&self, candidate: &EventCandidate, evidence: Option<&Frame>) -> Verdict {
        let score = self.scorer.score(candidate, evidence);
        let threshold = self.thresholds.get(candidate.event_type);
        let accepted = score >= threshold;

        let counters = &self.counters[Self::slot(candidate.event_type)];
        if accepted {
            counters.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            event_id = %candidate.id,
            event_type = %candidate.event_type,
            score,
            threshold,
            accepted,
            "Validated candidate"
        );
        Verdict { accepted, score }
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    pub fn counts(&self) -> BTreeMap<EventType, GateCounts> {
        EventType::ALL
            .into_iter()
            .map(|t| {
                let c = &self.counters[Self::slot(t)];
                (
                    t,
                    GateCounts {
                        accepted: c.accepted.load(Ordering::Relaxed),
                        rejected: c.rejected.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    fn slot(event_type: EventType) -> usize {
        match event_type {
            EventType::Intrusion => 0,
            EventType::Loitering => 1,
            EventType::CrowdAnomaly => 2,
            EventType::RemovalPattern => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BBox;
    use chrono::Utc;
    use ndarray::Array3;

    fn candidate(event_type: EventType, confidence: f32) -> EventCandidate {
        EventCandidate::new(event_type, "cam", 1, None, confidence, Utc::now())
    }

    struct ConstClassifier(Result<f32>);

    impl EvidenceClassifier for ConstClassifier {
        fn name(&self) -> &str {
            "const"
        }

        fn classify(&self, _event_type: EventType, crop: ArrayView3<'_, u8>) -> Result<f32> {
            assert!(crop.len() > 0);
            match &self.0 {
                Ok(v) => Ok(*v),
                Err(_) => Err(PipelineError::Inference("boom".into())),
            }
        }
    }

    #[test]
    fn test_heuristic_thresholds() {
        let validator = Validator::from_config(&ValidatorConfig::default(), None);

        // 0.72 * 0.95 = 0.684 >= 0.60
        assert!(validator.validate(&candidate(EventType::Loitering, 0.72), None).accepted);
        // 0.90 * 0.85 = 0.765 < 0.80
        let verdict = validator.validate(&candidate(EventType::RemovalPattern, 0.9), None);
        assert!(!verdict.accepted);
        assert!((verdict.score - 0.765).abs() < 1e-4);
        // 0.69 < 0.70
        assert!(!validator.validate(&candidate(EventType::Intrusion, 0.69), None).accepted);

        let counts = validator.counts();
        assert_eq!(counts[&EventType::Loitering].accepted, 1);
        assert_eq!(counts[&EventType::RemovalPattern].rejected, 1);
        assert_eq!(counts[&EventType::Intrusion].rejected, 1);
    }

    #[test]
    fn test_model_scorer_uses_crop() {
        let config = ValidatorConfig::default();
        let validator = Validator::from_config(&config, Some(Arc::new(ConstClassifier(Ok(0.95)))));
        let frame = Frame::new("cam", 0, Utc::now(), Array3::zeros((100, 100, 3)));
        let c = candidate(EventType::RemovalPattern, 0.1).with_bbox(BBox::new(10.0, 10.0, 40.0, 40.0));

        let verdict = validator.validate(&c, Some(&frame));
        assert!(verdict.accepted);
        assert_eq!(verdict.score, 0.95);
        assert_eq!(validator.scorer_name(), "const");
    }

    #[test]
    fn test_model_failure_falls_back_to_heuristic() {
        let config = ValidatorConfig::default();
        let validator = Validator::from_config(
            &config,
            Some(Arc::new(ConstClassifier(Err(PipelineError::Inference("x".into()))))),
        );
        let frame = Frame::new("cam", 0, Utc::now(), Array3::zeros((100, 100, 3)));
        let c = candidate(EventType::Intrusion, 0.8).with_bbox(BBox::new(10.0, 10.0, 40.0, 40.0));
        let verdict = validator.validate(&c, Some(&frame));
        assert!((verdict.score - 0.8).abs() < 1e-6);

        // no evidence at all
        let verdict = validator.validate(&candidate(EventType::Intrusion, 0.5), None);
        assert!(!verdict.accepted);
    }

    #[test]
    fn test_crop_tensor_scales_to_model_input() {
        let mut crop = Array3::zeros((4, 2, 3));
        crop[[3, 1, 0]] = 255u8;
        let tensor = crop_tensor(crop.view(), 8).unwrap();
        assert_eq!(tensor.dim(), (1, 3, 8, 8));
        assert_eq!(tensor[[0, 0, 7, 7]], 1.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 1, 7, 7]], 0.0);

        let empty = Array3::<u8>::zeros((0, 5, 3));
        assert!(crop_tensor(empty.view(), 8).is_err());
    }

    #[test]
    fn test_classifier_only_when_configured() {
        let mut config = ValidatorConfig::default();
        assert!(evidence_classifier(&config).unwrap().is_none());

        config.model_path = Some(std::path::PathBuf::from("/nonexistent/validator.onnx"));
        let err = evidence_classifier(&config).err().unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
