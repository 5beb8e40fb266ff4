// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Core types shared by every pipeline stage

mod event_bus;

pub use event_bus::{EventBus, PipelineEvent};

use std::sync::Arc;
use chrono::{DateTime, Utc};
use nalgebra::Point2;
use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Pixel position in frame coordinates
pub type Point = Point2<f32>;

/// A decoded frame, RGB, shape `(height, width, 3)`
///
/// The pixel buffer is shared, so cloning a frame to hand it to the next
/// stage never copies the image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<Array3<u8>>,
}

impl Frame {
    pub fn new(camera_id: &str, sequence: u64, captured_at: DateTime<Utc>, image: Array3<u8>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            sequence,
            captured_at,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> usize {
        self.image.dim().1
    }

    pub fn height(&self) -> usize {
        self.image.dim().0
    }

    /// A frame the detector can safely run on
    pub fn is_well_formed(&self) -> bool {
        let (h, w, c) = self.image.dim();
        h > 0 && w > 0 && c == 3
    }

    /// View of the region covered by `bbox`, clamped to the frame
    pub fn crop(&self, bbox: &BBox) -> Option<ArrayView3<'_, u8>> {
        let clamped = bbox.clamp(self.width() as f32, self.height() as f32);
        let (x1, y1) = (clamped.x1.floor() as usize, clamped.y1.floor() as usize);
        let (x2, y2) = (clamped.x2.ceil() as usize, clamped.y2.ceil() as usize);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(self.image.slice(s![y1..y2, x1..x2, ..]))
    }
}

/// Axis-aligned box, `[x1, y1, x2, y2]` in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn centroid(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Intersection over union
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        inter / (union + 1e-6)
    }

    pub fn clamp(&self, width: f32, height: f32) -> BBox {
        BBox {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }

    /// Grow the box by `ratio` of its size on every side
    pub fn pad(&self, ratio: f32) -> BBox {
        let dx = self.width() * ratio;
        let dy = self.height() * ratio;
        BBox {
            x1: self.x1 - dx,
            y1: self.y1 - dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }
}

/// Single object found by the detector in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class_id: usize, class_label: &str, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            class_label: class_label.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    pub fn centroid(&self) -> Point {
        self.bbox.centroid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-4);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        // 50 / 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_centroid() {
        let bbox = BBox::new(100.0, 100.0, 200.0, 300.0);
        let c = bbox.centroid();
        assert_eq!((c.x, c.y), (150.0, 200.0));
    }

    #[test]
    fn test_crop_is_clamped() {
        let frame = Frame::new("cam", 0, Utc::now(), Array3::from_elem((6, 8, 3), 7u8));
        let crop = frame.crop(&BBox::new(-5.0, 2.0, 4.0, 100.0)).unwrap();
        assert_eq!(crop.dim(), (4, 4, 3));
        assert!(frame.crop(&BBox::new(50.0, 50.0, 60.0, 60.0)).is_none());
    }
}
