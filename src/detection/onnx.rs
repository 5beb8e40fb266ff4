// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! ONNX Runtime sessions

use std::path::Path;
use ndarray::{Array2, Array4};
use ort::{
    memory::Allocator,
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use parking_lot::Mutex;
use tracing::info;

use super::yolo::{rows_from_output, TensorModel};
use crate::error::{PipelineError, Result};

/// A loaded model. Runs are serialized since a session run needs `&mut`.
pub struct OnnxSession {
    session: Mutex<Session>,
    name: String,
}

impl OnnxSession {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::Configuration(format!("model file {:?} not found", path)));
        }
        let session = build_session(path)
            .map_err(|e| PipelineError::Configuration(format!("failed to load model {:?}: {}", path, e)))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        info!(model = %name, "ONNX model loaded from {:?}", path);

        Ok(Self {
            session: Mutex::new(session),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First output as shape and flat data
    pub fn run(&self, input: Array4<f32>) -> Result<(Vec<i64>, Vec<f32>)> {
        self.run_first(input)
            .map_err(|e| PipelineError::Inference(format!("{}: {}", self.name, e)))
    }

    fn run_first(&self, input: Array4<f32>) -> ort::Result<(Vec<i64>, Vec<f32>)> {
        let (n, c, h, w) = input.dim();
        let mut tensor = Tensor::<f32>::new(&Allocator::default(), [n, c, h, w])?;
        {
            let (_, data) = tensor.try_extract_tensor_mut::<f32>()?;
            for (dst, src) in data.iter_mut().zip(input.iter()) {
                *dst = *src;
            }
        }

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![tensor])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok((shape.iter().copied().collect(), data.to_vec()))
    }
}

fn build_session(path: &Path) -> ort::Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)
}

/// YOLO export run through ONNX Runtime
pub struct OnnxDetector {
    session: OnnxSession,
    input_size: usize,
    classes: usize,
}

impl OnnxDetector {
    pub fn load(path: &Path, input_size: usize, classes: usize) -> Result<Self> {
        Ok(Self {
            session: OnnxSession::load(path)?,
            input_size,
            classes,
        })
    }
}

impl TensorModel for OnnxDetector {
    fn input_size(&self) -> (usize, usize) {
        (self.input_size, self.input_size)
    }

    fn run(&self, input: Array4<f32>) -> Result<Array2<f32>> {
        let (shape, data) = self.session.run(input)?;
        rows_from_output(&shape, data, self.classes)
    }
}
