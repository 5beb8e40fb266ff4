// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Multi-object tracker - greedy nearest-centroid association

use std::collections::BTreeMap;
use chrono::{DateTime, Duration, Utc};
use nalgebra::distance;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::TrackerConfig;
use crate::core::{Detection, Point};

/// A persistent object identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub class_label: String,
    /// Frame sequence number -> detection, oldest entries trimmed
    pub history: BTreeMap<u64, Detection>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub last_sequence: u64,
    pub hits: u64,
}

impl Track {
    fn new(id: u64, sequence: u64, detection: Detection, timestamp: DateTime<Utc>) -> Self {
        let mut history = BTreeMap::new();
        let class_label = detection.class_label.clone();
        history.insert(sequence, detection);
        Self {
            id,
            class_label,
            history,
            created_at: timestamp,
            last_update: timestamp,
            last_sequence: sequence,
            hits: 1,
        }
    }

    pub fn last_detection(&self) -> Option<&Detection> {
        self.history.values().next_back()
    }

    pub fn centroid(&self) -> Option<Point> {
        self.last_detection().map(|d| d.centroid())
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.values().map(|d| d.confidence).sum::<f32>() / self.history.len() as f32
    }

    /// Matched on the frame with this sequence number
    pub fn seen_at(&self, sequence: u64) -> bool {
        self.last_sequence == sequence
    }
}

/// Tracker settings
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub max_match_distance: f32,
    pub max_inactive_age: Duration,
    pub history_len: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_match_distance: 150.0,
            max_inactive_age: Duration::seconds(30),
            history_len: 300,
        }
    }
}

impl From<&TrackerConfig> for TrackerSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            max_match_distance: config.max_match_distance,
            max_inactive_age: Duration::milliseconds((config.max_inactive_age_secs * 1000.0) as i64),
            history_len: config.history_len.max(1),
        }
    }
}

pub struct Tracker {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    settings: TrackerSettings,
    evicted: u64,
}

impl Tracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            settings,
            evicted: 0,
        }
    }

    /// Associate one frame of detections and return every live track,
    /// ordered by id.
    pub fn update(&mut self, sequence: u64, detections: &[Detection], timestamp: DateTime<Utc>) -> Vec<&Track> {
        // candidate pairs within range, same class, nearest first
        let mut pairs: Vec<(f32, u64, usize)> = Vec::new();
        for track in self.tracks.values() {
            let Some(tc) = track.centroid() else { continue };
            for (idx, det) in detections.iter().enumerate() {
                if det.class_label != track.class_label {
                    continue;
                }
                let d = distance(&tc, &det.centroid());
                if d <= self.settings.max_match_distance {
                    pairs.push((d, track.id, idx));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut matched_det = vec![false; detections.len()];
        let mut matched_tracks = Vec::new();
        for (_, track_id, idx) in pairs {
            if matched_det[idx] || matched_tracks.contains(&track_id) {
                continue;
            }
            matched_det[idx] = true;
            matched_tracks.push(track_id);

            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.history.insert(sequence, detections[idx].clone());
                while track.history.len() > self.settings.history_len {
                    track.history.pop_first();
                }
                track.last_update = timestamp;
                track.last_sequence = sequence;
                track.hits += 1;
            }
        }

        for (idx, det) in detections.iter().enumerate() {
            if matched_det[idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            trace!(track_id = id, class = %det.class_label, "New track");
            self.tracks.insert(id, Track::new(id, sequence, det.clone(), timestamp));
        }

        self.evict_stale(timestamp);
        self.tracks.values().collect()
    }

    /// Drop tracks unmatched for longer than `max_inactive_age`
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> Vec<u64> {
        let max_age = self.settings.max_inactive_age;
        let stale: Vec<u64> = self
            .tracks
            .values()
            .filter(|t| now - t.last_update > max_age)
            .map(|t| t.id)
            .collect();
        for id in &stale {
            self.tracks.remove(id);
            trace!(track_id = id, "Track evicted");
        }
        self.evicted += stale.len() as u64;
        stale
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Forget every track. Ids keep increasing afterwards.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BBox;
    use chrono::TimeZone;

    fn person(x: f32, y: f32) -> Detection {
        Detection::new(0, "person", 0.8, BBox::new(x - 10.0, y - 20.0, x + 10.0, y + 20.0))
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_tracks_follow_nearest() {
        let mut tracker = Tracker::new(TrackerSettings::default());
        let ids: Vec<u64> = tracker
            .update(0, &[person(100.0, 100.0), person(400.0, 100.0)], t(0))
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        // detections arrive in swapped order and slightly moved
        let tracks = tracker.update(1, &[person(410.0, 105.0), person(95.0, 100.0)], t(1));
        assert_eq!(tracks.len(), 2);
        let c1 = tracks[0].centroid().unwrap();
        assert_eq!(tracks[0].id, 1);
        assert!((c1.x - 95.0).abs() < 1e-3);
        assert_eq!(tracks[1].history.len(), 2);
    }

    #[test]
    fn test_far_detection_creates_new_track() {
        let mut tracker = Tracker::new(TrackerSettings::default());
        tracker.update(0, &[person(100.0, 100.0)], t(0));
        let tracks = tracker.update(1, &[person(600.0, 500.0)], t(1));
        assert_eq!(tracks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!tracks[0].seen_at(1));
        assert!(tracks[1].seen_at(1));
    }

    #[test]
    fn test_classes_do_not_mix() {
        let mut tracker = Tracker::new(TrackerSettings::default());
        tracker.update(0, &[person(100.0, 100.0)], t(0));
        let bag = Detection::new(24, "backpack", 0.9, BBox::new(95.0, 95.0, 105.0, 105.0));
        let tracks = tracker.update(1, &[bag], t(1));
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn test_eviction_and_ids_never_reused() {
        let mut tracker = Tracker::new(TrackerSettings::default());
        tracker.update(0, &[person(100.0, 100.0)], t(0));
        // 30s exactly is still alive
        assert_eq!(tracker.update(1, &[], t(30)).len(), 1);
        assert!(tracker.update(2, &[], t(31)).is_empty());
        assert_eq!(tracker.evicted_count(), 1);

        let tracks = tracker.update(3, &[person(100.0, 100.0)], t(32));
        assert_eq!(tracks[0].id, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = Tracker::new(TrackerSettings {
            history_len: 3,
            ..Default::default()
        });
        for seq in 0..10 {
            tracker.update(seq, &[person(100.0 + seq as f32, 100.0)], t(seq as i64));
        }
        let track = tracker.get(1).unwrap();
        assert_eq!(track.history.keys().copied().collect::<Vec<_>>(), vec![7, 8, 9]);
        assert_eq!(track.hits, 10);
    }
}
