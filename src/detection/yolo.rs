// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! YOLO-style detection head on top of a pluggable tensor runtime

use std::sync::Arc;
use ndarray::{Array2, Array3, Array4};

use super::InferenceBackend;
use crate::core::{BBox, Detection};
use crate::error::{PipelineError, Result};

/// COCO class names, in model output order
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

const PAD_VALUE: f32 = 114.0 / 255.0;

/// The model runtime seam.
///
/// Input is `[1, 3, H, W]` normalized RGB; output is `[N, 4 + classes]`
/// rows of `cx, cy, w, h` in input pixels followed by class scores.
pub trait TensorModel: Send + Sync {
    fn input_size(&self) -> (usize, usize);

    fn run(&self, input: Array4<f32>) -> Result<Array2<f32>>;
}

/// Scale and padding applied by letterboxing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn compute(src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Self {
        let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
        let new_w = (src_w as f32 * scale).round();
        let new_h = (src_h as f32 * scale).round();
        Self {
            scale,
            pad_x: ((dst_w as f32 - new_w) / 2.0).floor(),
            pad_y: ((dst_h as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Model input coordinates back to source frame coordinates
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Resize with aspect preserved into a padded `[1, 3, H, W]` tensor
pub fn letterbox(image: &Array3<u8>, dst_w: usize, dst_h: usize) -> (Array4<f32>, Letterbox) {
    let (src_h, src_w, _) = image.dim();
    let lb = Letterbox::compute(src_w, src_h, dst_w, dst_h);
    let mut tensor = Array4::from_elem((1, 3, dst_h, dst_w), PAD_VALUE);

    let new_w = ((src_w as f32 * lb.scale).round() as usize).min(dst_w);
    let new_h = ((src_h as f32 * lb.scale).round() as usize).min(dst_h);
    let (ox, oy) = (lb.pad_x as usize, lb.pad_y as usize);

    // nearest neighbour
    for y in 0..new_h {
        let sy = ((y as f32 / lb.scale) as usize).min(src_h - 1);
        for x in 0..new_w {
            let sx = ((x as f32 / lb.scale) as usize).min(src_w - 1);
            for c in 0..3 {
                tensor[[0, c, oy + y, ox + x]] = image[[sy, sx, c]] as f32 / 255.0;
            }
        }
    }

    (tensor, lb)
}

/// Normalize a raw model output into `[N, 4 + classes]` rows.
///
/// Accepts anchor-major `[1, N, 4 + classes]`, channel-major
/// `[1, 4 + classes, N]`, and layouts with an objectness column after the
/// box, which is folded into the class scores.
pub fn rows_from_output(shape: &[i64], data: Vec<f32>, classes: usize) -> Result<Array2<f32>> {
    let unbatched = match shape {
        [1, rest @ ..] if shape.len() == 3 => rest,
        _ => shape,
    };
    let dims: Vec<usize> = unbatched.iter().map(|&d| d.max(0) as usize).collect();
    let bad_shape = || PipelineError::Inference(format!("unexpected output shape {:?}", shape));
    let &[a, b] = dims.as_slice() else {
        return Err(bad_shape());
    };
    let raw = Array2::from_shape_vec((a, b), data).map_err(|_| bad_shape())?;

    let (boxes_only, with_objectness) = (4 + classes, 5 + classes);
    let rows = if b == boxes_only || b == with_objectness {
        raw
    } else if a == boxes_only || a == with_objectness {
        raw.reversed_axes().as_standard_layout().into_owned()
    } else {
        return Err(bad_shape());
    };

    if rows.ncols() == boxes_only {
        return Ok(rows);
    }

    let mut folded = Array2::zeros((rows.nrows(), boxes_only));
    for (mut out, row) in folded.rows_mut().into_iter().zip(rows.rows()) {
        let objectness = row[4];
        for i in 0..4 {
            out[i] = row[i];
        }
        for c in 0..classes {
            out[4 + c] = row[5 + c] * objectness;
        }
    }
    Ok(folded)
}

/// Decode raw output rows into frame-space detections
pub fn decode(
    output: &Array2<f32>,
    lb: &Letterbox,
    labels: &[String],
    confidence_threshold: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();

    for row in output.rows() {
        if row.len() <= 4 {
            continue;
        }
        let scores = row.slice(ndarray::s![4..]);
        let Some((class_id, &score)) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if score < confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let (x1, y1) = lb.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = lb.unmap(cx + w / 2.0, cy + h / 2.0);

        let label = labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id));
        detections.push(Detection::new(class_id, &label, score, BBox::new(x1, y1, x2, y2)));
    }

    detections
}

/// `InferenceBackend` driving a YOLO-style `TensorModel`
pub struct YoloBackend {
    model: Arc<dyn TensorModel>,
    labels: Vec<String>,
    confidence_threshold: f32,
}

impl YoloBackend {
    pub fn new(model: Arc<dyn TensorModel>, labels: Vec<String>, confidence_threshold: f32) -> Self {
        let labels = if labels.is_empty() {
            COCO_LABELS.iter().map(|s| s.to_string()).collect()
        } else {
            labels
        };
        Self {
            model,
            labels,
            confidence_threshold,
        }
    }
}

impl InferenceBackend for YoloBackend {
    fn name(&self) -> &str {
        "yolo"
    }

    fn infer(&self, image: &Array3<u8>) -> Result<Vec<Detection>> {
        let (src_h, src_w, _) = image.dim();
        if src_h == 0 || src_w == 0 {
            return Err(PipelineError::Decode("empty image".into()));
        }

        let (in_w, in_h) = self.model.input_size();
        let (tensor, lb) = letterbox(image, in_w, in_h);
        let output = self.model.run(tensor)?;

        if output.ncols() < 5 {
            return Err(PipelineError::Inference(format!(
                "unexpected output shape {:?}",
                output.dim()
            )));
        }

        let (w, h) = (src_w as f32, src_h as f32);
        Ok(decode(&output, &lb, &self.labels, self.confidence_threshold)
            .into_iter()
            .map(|mut d| {
                d.bbox = d.bbox.clamp(w, h);
                d
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    struct EchoModel {
        rows: Array2<f32>,
    }

    impl TensorModel for EchoModel {
        fn input_size(&self) -> (usize, usize) {
            (640, 640)
        }

        fn run(&self, input: Array4<f32>) -> Result<Array2<f32>> {
            assert_eq!(input.dim(), (1, 3, 640, 640));
            Ok(self.rows.clone())
        }
    }

    #[test]
    fn test_letterbox_geometry() {
        let lb = Letterbox::compute(1280, 720, 640, 640);
        assert_eq!(lb.scale, 0.5);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 140.0));
        assert_eq!(lb.unmap(320.0, 320.0), (640.0, 360.0));
    }

    #[test]
    fn test_letterbox_pads_with_gray() {
        let image = Array3::from_elem((2, 4, 3), 255u8);
        let (tensor, lb) = letterbox(&image, 8, 8);
        assert_eq!(lb.scale, 2.0);
        assert!((tensor[[0, 0, 0, 0]] - PAD_VALUE).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 4, 4]], 1.0);
    }

    #[test]
    fn test_backend_decodes_to_frame_space() {
        // person centred in letterboxed input, second row below threshold
        let rows = array![
            [320.0, 320.0, 100.0, 200.0, 0.9, 0.1],
            [100.0, 100.0, 10.0, 10.0, 0.2, 0.3],
        ];
        let backend = YoloBackend::new(Arc::new(EchoModel { rows }), vec![], 0.5);
        let image = Array3::zeros((720, 1280, 3));

        let out = backend.infer(&image).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_label, "person");
        assert_eq!(out[0].bbox, BBox::new(540.0, 160.0, 740.0, 560.0));
    }

    #[test]
    fn test_channel_major_output_is_transposed() {
        // two classes, three anchors laid out as [1, 6, 3]
        let data = vec![
            10.0, 20.0, 30.0, // cx
            11.0, 21.0, 31.0, // cy
            5.0, 5.0, 5.0, // w
            6.0, 6.0, 6.0, // h
            0.9, 0.1, 0.2, // class 0
            0.0, 0.8, 0.3, // class 1
        ];
        let rows = rows_from_output(&[1, 6, 3], data, 2).unwrap();
        assert_eq!(rows.dim(), (3, 6));
        assert_eq!(rows.row(1).to_vec(), vec![20.0, 21.0, 5.0, 6.0, 0.1, 0.8]);
    }

    #[test]
    fn test_objectness_is_folded_into_scores() {
        let data = vec![10.0, 10.0, 4.0, 4.0, 0.5, 0.8, 0.2];
        let rows = rows_from_output(&[1, 1, 7], data, 2).unwrap();
        assert_eq!(rows.dim(), (1, 6));
        assert!((rows[[0, 4]] - 0.4).abs() < 1e-6);
        assert!((rows[[0, 5]] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_output_layout_is_rejected() {
        let err = rows_from_output(&[1, 3, 3], vec![0.0; 9], 80).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
        assert!(rows_from_output(&[2, 2, 2, 2], vec![0.0; 16], 1).is_err());
    }

    #[test]
    fn test_backend_rejects_bad_output() {
        let backend = YoloBackend::new(Arc::new(EchoModel { rows: Array2::zeros((3, 4)) }), vec![], 0.5);
        let err = backend.infer(&Array3::zeros((720, 1280, 3))).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }
}
