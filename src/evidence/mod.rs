// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Evidence snapshots for accepted events

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use tracing::debug;

use crate::config::EvidenceConfig;
use crate::core::Frame;
use crate::error::{PipelineError, Result};
use crate::events::EventCandidate;

/// Persists evidence for a candidate and returns a reference to it
pub trait EvidenceSink: Send + Sync {
    fn store(&self, candidate: &EventCandidate, frame: &Frame) -> Result<String>;
}

/// Writes a padded JPEG crop of the candidate box to a directory
pub struct SnapshotEvidenceSink {
    dir: PathBuf,
    padding: f32,
    quality: u8,
}

impl SnapshotEvidenceSink {
    pub fn new(config: &EvidenceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.snapshot_dir)?;
        Ok(Self {
            dir: config.snapshot_dir.clone(),
            padding: config.padding.max(0.0),
            quality: config.jpeg_quality.clamp(1, 100),
        })
    }

    fn file_name(candidate: &EventCandidate) -> String {
        let camera: String = candidate
            .camera_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let id = candidate.id.simple().to_string();
        format!(
            "{}_{}_{}_{}.jpg",
            camera,
            candidate.event_type,
            candidate.timestamp.format("%Y%m%d_%H%M%S"),
            &id[..8]
        )
    }
}

impl EvidenceSink for SnapshotEvidenceSink {
    fn store(&self, candidate: &EventCandidate, frame: &Frame) -> Result<String> {
        let crop = match candidate.bbox {
            Some(bbox) => frame.crop(&bbox.pad(self.padding)),
            None => Some(frame.image.view()),
        }
        .ok_or_else(|| PipelineError::Decode("evidence box lies outside the frame".into()))?;

        let (h, w, _) = crop.dim();
        let pixels: Vec<u8> = crop.iter().copied().collect();

        let path = self.dir.join(Self::file_name(candidate));
        let mut writer = BufWriter::new(File::create(&path)?);
        JpegEncoder::new_with_quality(&mut writer, self.quality)
            .encode(&pixels, w as u32, h as u32, ColorType::Rgb8)
            .map_err(|e| PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        writer.flush()?;

        debug!(event_id = %candidate.id, "Evidence saved to {:?}", path);
        Ok(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BBox;
    use crate::events::EventType;
    use chrono::Utc;
    use ndarray::Array3;

    fn sink(dir: &std::path::Path) -> SnapshotEvidenceSink {
        SnapshotEvidenceSink::new(&EvidenceConfig {
            snapshot_dir: dir.join("snaps"),
            padding: 0.25,
            ..EvidenceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_writes_padded_crop() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let frame = Frame::new("yard/cam 1", 3, Utc::now(), Array3::from_elem((120, 160, 3), 200u8));
        let candidate = EventCandidate::new(EventType::Intrusion, "yard/cam 1", 2, None, 0.9, Utc::now())
            .with_bbox(BBox::new(40.0, 20.0, 80.0, 100.0));

        let reference = sink.store(&candidate, &frame).unwrap();
        assert!(reference.ends_with(".jpg"));
        assert!(reference.contains("yard_cam_1_intrusion_"));

        let img = image::open(&reference).unwrap();
        // 40x80 box padded by a quarter per side, clamped to the frame
        assert_eq!(img.to_rgb8().dimensions(), (60, 120));
    }

    #[test]
    fn test_box_outside_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let frame = Frame::new("cam", 0, Utc::now(), Array3::zeros((50, 50, 3)));
        let candidate = EventCandidate::new(EventType::Loitering, "cam", 1, None, 0.9, Utc::now())
            .with_bbox(BBox::new(500.0, 500.0, 600.0, 600.0));
        assert!(sink.store(&candidate, &frame).is_err());
    }
}
