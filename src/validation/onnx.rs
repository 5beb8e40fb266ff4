// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Evidence classifier run through ONNX Runtime

use std::path::Path;
use ndarray::ArrayView3;

use super::{crop_tensor, EvidenceClassifier};
use crate::detection::onnx::OnnxSession;
use crate::error::{PipelineError, Result};
use crate::events::EventType;

/// Binary classifier whose first output is the event's confidence
pub struct OnnxClassifier {
    session: OnnxSession,
    input_size: usize,
}

impl OnnxClassifier {
    pub fn load(path: &Path, input_size: usize) -> Result<Self> {
        Ok(Self {
            session: OnnxSession::load(path)?,
            input_size,
        })
    }
}

impl EvidenceClassifier for OnnxClassifier {
    fn name(&self) -> &str {
        self.session.name()
    }

    fn classify(&self, _event_type: EventType, crop: ArrayView3<'_, u8>) -> Result<f32> {
        let input = crop_tensor(crop, self.input_size)?;
        let (_, scores) = self.session.run(input)?;
        scores
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Inference(format!("{} returned no score", self.session.name())))
    }
}
