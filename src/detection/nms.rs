// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Class-wise greedy non-maximum suppression

use std::collections::BTreeMap;

use crate::core::Detection;

/// Collapse same-class boxes overlapping at `iou_threshold` or more onto
/// the highest-confidence one. Output is sorted by confidence, descending.
pub fn classwise_nms(detections: Vec<Detection>, iou_threshold: f32, max_total: usize) -> Vec<Detection> {
    if detections.is_empty() {
        return Vec::new();
    }

    let mut by_class: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
    for det in detections {
        by_class.entry(det.class_id).or_default().push(det);
    }

    let mut kept = Vec::new();
    for (_, mut boxes) in by_class {
        boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut suppressed = vec![false; boxes.len()];
        for i in 0..boxes.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..boxes.len() {
                if !suppressed[j] && boxes[i].bbox.iou(&boxes[j].bbox) >= iou_threshold {
                    suppressed[j] = true;
                }
            }
        }

        kept.extend(
            boxes
                .into_iter()
                .zip(suppressed)
                .filter_map(|(det, gone)| (!gone).then_some(det)),
        );
    }

    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept.truncate(max_total);
    kept
}
