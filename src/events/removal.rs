// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Object removal heuristic
//!
//! An object of a monitored class resting inside a protected zone for
//! enough consecutive sightings becomes armed. If it then vanishes in place
//! while a person who came close to it shows up at or near an exit around
//! the same time, a `removal_pattern` candidate is raised. An object seen
//! back in place after its removal was resolved is watched again. This is an
//! approximation and will miss or misfire in cluttered scenes.

use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Duration, Utc};
use nalgebra::distance;
use serde_json::json;
use tracing::debug;

use super::{secs, EventCandidate, EventType, Zone, ZoneRole};
use crate::config::EventConfig;
use crate::core::{BBox, Point};
use crate::tracking::Track;

#[derive(Debug, Clone)]
pub struct RemovalSettings {
    pub person_class: String,
    pub monitored_classes: HashSet<String>,
    pub stable_frames: u32,
    pub grace: Duration,
    pub exit_window: Duration,
    pub proximity_px: f32,
    /// A person this close to an exit polygon counts as at the exit
    pub exit_proximity_px: f32,
}

impl From<&EventConfig> for RemovalSettings {
    fn from(config: &EventConfig) -> Self {
        Self {
            person_class: config.person_class.clone(),
            monitored_classes: config.monitored_classes.iter().cloned().collect(),
            stable_frames: config.removal_stable_frames.max(1),
            grace: secs(config.removal_grace_secs),
            exit_window: secs(config.removal_exit_window_secs),
            proximity_px: config.removal_proximity_px,
            exit_proximity_px: config.removal_exit_proximity_px.max(0.0),
        }
    }
}

#[derive(Debug, Clone)]
struct ObjectState {
    class_label: String,
    zone: usize,
    consecutive: u32,
    armed: bool,
    resolved: bool,
    last_seen: DateTime<Utc>,
    last_centroid: Point,
    last_bbox: BBox,
    confidence: f32,
    /// person track id -> last time within reach
    nearby: HashMap<u64, DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PersonState {
    last_seen: DateTime<Utc>,
    confidence: f32,
    last_exit: Option<(DateTime<Utc>, usize)>,
}

pub struct RemovalDetector {
    settings: RemovalSettings,
    objects: HashMap<u64, ObjectState>,
    persons: HashMap<u64, PersonState>,
}

impl RemovalDetector {
    pub fn new(settings: RemovalSettings) -> Self {
        Self {
            settings,
            objects: HashMap::new(),
            persons: HashMap::new(),
        }
    }

    pub fn observe(
        &mut self,
        camera_id: &str,
        zones: &[Zone],
        tracks: &[&Track],
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Vec<EventCandidate> {
        let seen: Vec<&Track> = tracks.iter().copied().filter(|t| t.seen_at(sequence)).collect();

        // people and exits
        for track in seen.iter().filter(|t| t.class_label == self.settings.person_class) {
            let Some(c) = track.centroid() else { continue };
            let state = self.persons.entry(track.id).or_insert(PersonState {
                last_seen: now,
                confidence: 0.0,
                last_exit: None,
            });
            state.last_seen = now;
            state.confidence = track.mean_confidence();
            let nearest_exit = zones
                .iter()
                .enumerate()
                .filter(|(_, z)| z.role == ZoneRole::Exit)
                .map(|(idx, z)| (idx, z.distance_to(&c)))
                .filter(|(_, d)| *d <= self.settings.exit_proximity_px)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((idx, _)) = nearest_exit {
                state.last_exit = Some((now, idx));
            }
        }

        // monitored objects
        for track in seen.iter().filter(|t| self.settings.monitored_classes.contains(&t.class_label)) {
            let (Some(det), Some(c)) = (track.last_detection(), track.centroid()) else {
                continue;
            };
            let protected = zones
                .iter()
                .position(|z| z.role == ZoneRole::Protected && z.contains(&c));

            match protected {
                Some(zone) => {
                    let state = self.objects.entry(track.id).or_insert(ObjectState {
                        class_label: track.class_label.clone(),
                        zone,
                        consecutive: 0,
                        armed: false,
                        resolved: false,
                        last_seen: now,
                        last_centroid: c,
                        last_bbox: det.bbox,
                        confidence: 0.0,
                        nearby: HashMap::new(),
                    });
                    if state.zone != zone {
                        state.zone = zone;
                        state.consecutive = 0;
                        state.armed = false;
                    }
                    if state.resolved {
                        // back in place after an occlusion or a false alarm
                        state.resolved = false;
                        state.armed = false;
                        state.consecutive = 0;
                        state.nearby.clear();
                        debug!(camera_id = %camera_id, track_id = track.id, "Object back in protected zone");
                    }
                    state.consecutive += 1;
                    state.last_seen = now;
                    state.last_centroid = c;
                    state.last_bbox = det.bbox;
                    state.confidence = track.mean_confidence();
                    if !state.armed && state.consecutive >= self.settings.stable_frames {
                        state.armed = true;
                        debug!(camera_id = %camera_id, track_id = track.id, "Object armed for removal watch");
                    }
                }
                None => {
                    // moved out, not removed
                    if let Some(state) = self.objects.get_mut(&track.id) {
                        state.consecutive = 0;
                        state.armed = false;
                        state.last_seen = now;
                        state.last_centroid = c;
                    }
                }
            }
        }

        // who came close to an armed object
        let persons_seen: Vec<(u64, Point)> = seen
            .iter()
            .filter(|t| t.class_label == self.settings.person_class)
            .filter_map(|t| t.centroid().map(|c| (t.id, c)))
            .collect();
        for state in self.objects.values_mut().filter(|s| s.armed && s.last_seen == now) {
            for (pid, pc) in &persons_seen {
                if distance(pc, &state.last_centroid) <= self.settings.proximity_px {
                    state.nearby.insert(*pid, now);
                }
            }
        }

        // armed objects that vanished in place
        let mut candidates = Vec::new();
        let replacements: Vec<(String, Point)> = seen
            .iter()
            .filter(|t| self.settings.monitored_classes.contains(&t.class_label))
            .filter_map(|t| t.centroid().map(|c| (t.class_label.clone(), c)))
            .collect();

        for (&object_id, state) in self.objects.iter_mut() {
            if !state.armed || state.resolved || now - state.last_seen < self.settings.grace {
                continue;
            }

            // same kind of object at the same spot under a new id
            let replaced = replacements.iter().any(|(label, c)| {
                *label == state.class_label
                    && distance(c, &state.last_centroid) <= self.settings.proximity_px / 2.0
            });
            if replaced {
                state.resolved = true;
                continue;
            }

            let vanished_at = state.last_seen;
            let window = self.settings.exit_window;
            let suspect = state
                .nearby
                .keys()
                .filter_map(|pid| self.persons.get(pid).map(|p| (*pid, p)))
                .filter_map(|(pid, p)| p.last_exit.map(|(at, zone)| (pid, p, at, zone)))
                .filter(|(_, _, at, _)| (*at - vanished_at).abs() <= window)
                .min_by_key(|(_, _, at, _)| (*at - vanished_at).abs());

            match suspect {
                Some((person_id, person, exit_at, exit_zone)) => {
                    state.resolved = true;
                    let zone = &zones[state.zone];
                    let candidate = EventCandidate::new(
                        EventType::RemovalPattern,
                        camera_id,
                        object_id,
                        Some(zone.id.clone()),
                        state.confidence.min(person.confidence),
                        now,
                    )
                    .with_bbox(state.last_bbox)
                    .with_meta("object_track_id", json!(object_id))
                    .with_meta("person_track_id", json!(person_id))
                    .with_meta("object_class", json!(state.class_label))
                    .with_meta("exit_zone_id", json!(zones[exit_zone].id))
                    .with_meta(
                        "exit_offset_secs",
                        json!((exit_at - vanished_at).num_milliseconds() as f64 / 1000.0),
                    );
                    candidates.push(candidate);
                }
                None if now - vanished_at > self.settings.grace + window => {
                    // nobody left with it
                    state.resolved = true;
                }
                None => {}
            }
        }

        candidates
    }

    /// Drop state not refreshed since `cutoff`
    pub fn purge(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.objects.len() + self.persons.len();
        self.objects.retain(|_, s| s.last_seen >= cutoff);
        self.persons.retain(|_, p| p.last_seen >= cutoff);
        for state in self.objects.values_mut() {
            state.nearby.retain(|_, at| *at >= cutoff);
        }
        before - (self.objects.len() + self.persons.len())
    }

    pub fn armed_count(&self) -> usize {
        self.objects.values().filter(|s| s.armed && !s.resolved).count()
    }

    pub fn reset(&mut self) {
        self.objects.clear();
        self.persons.clear();
    }
}
