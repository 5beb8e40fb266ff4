// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Temporal event engine
//!
//! Turns track history into discrete event candidates. State is kept per
//! (track, zone) pair for dwell based rules and per zone for crowd counts.
//! Nothing here looks at pixels; the engine only sees tracks and time.

mod removal;
mod zone;

pub use removal::{RemovalDetector, RemovalSettings};
pub use zone::{Schedule, Window, Zone, ZoneRole};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use nalgebra::distance;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EventConfig;
use crate::core::{BBox, Point};
use crate::tracking::Track;

pub(crate) fn secs(value: f64) -> Duration {
    Duration::milliseconds((value.max(0.0) * 1000.0) as i64)
}

fn as_secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Kinds of security events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Intrusion,
    Loitering,
    CrowdAnomaly,
    RemovalPattern,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Intrusion,
        EventType::Loitering,
        EventType::CrowdAnomaly,
        EventType::RemovalPattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Intrusion => "intrusion",
            EventType::Loitering => "loitering",
            EventType::CrowdAnomaly => "crowd_anomaly",
            EventType::RemovalPattern => "removal_pattern",
        }
    }

    pub fn parse(value: &str) -> Option<EventType> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    pub fn severity(&self) -> Severity {
        match self {
            EventType::Intrusion => Severity::High,
            EventType::Loitering => Severity::Medium,
            EventType::CrowdAnomaly => Severity::Medium,
            EventType::RemovalPattern => Severity::Critical,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Unconfirmed event waiting for the validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCandidate {
    pub id: Uuid,
    pub event_type: EventType,
    pub camera_id: String,
    pub track_id: u64,
    pub zone_id: Option<String>,
    pub confidence: f32,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub bbox: Option<BBox>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub validator_score: Option<f32>,
}

impl EventCandidate {
    pub fn new(
        event_type: EventType,
        camera_id: &str,
        track_id: u64,
        zone_id: Option<String>,
        confidence: f32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            camera_id: camera_id.to_string(),
            track_id,
            zone_id,
            confidence: confidence.clamp(0.0, 1.0),
            severity: event_type.severity(),
            timestamp,
            bbox: None,
            metadata: BTreeMap::new(),
            validator_score: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// The only change allowed after creation
    pub fn with_score(mut self, score: f32) -> Self {
        self.validator_score = Some(score);
        self
    }
}

#[derive(Debug, Clone)]
struct TrackZoneState {
    inside: bool,
    dwell: Duration,
    last_tick: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    intrusion_fired: bool,
    conf_sum: f32,
    conf_count: u32,
    loiter_anchor: Point,
    loiter_since: DateTime<Utc>,
    loiter_fired: bool,
}

impl TrackZoneState {
    fn entered(at: DateTime<Utc>, c: Point) -> Self {
        Self {
            inside: true,
            dwell: Duration::zero(),
            last_tick: at,
            last_seen: at,
            intrusion_fired: false,
            conf_sum: 0.0,
            conf_count: 0,
            loiter_anchor: c,
            loiter_since: at,
            loiter_fired: false,
        }
    }

    fn mean_confidence(&self) -> f32 {
        if self.conf_count == 0 {
            0.0
        } else {
            self.conf_sum / self.conf_count as f32
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ZoneState {
    last_crowd_emit: Option<DateTime<Utc>>,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub emitted: BTreeMap<String, u64>,
    pub tracked_pairs: usize,
    pub armed_objects: usize,
    pub purged: u64,
}

/// Per-camera event state machine
pub struct EventEngine {
    camera_id: String,
    config: EventConfig,
    zones: Arc<Vec<Zone>>,
    pairs: HashMap<(u64, usize), TrackZoneState>,
    zone_state: Vec<ZoneState>,
    removal: RemovalDetector,
    last_sweep: Option<DateTime<Utc>>,
    stats: EngineStats,
}

impl EventEngine {
    pub fn new(camera_id: &str, config: EventConfig, zones: Arc<Vec<Zone>>) -> Self {
        let removal = RemovalDetector::new(RemovalSettings::from(&config));
        Self {
            camera_id: camera_id.to_string(),
            zone_state: vec![ZoneState::default(); zones.len()],
            config,
            zones,
            pairs: HashMap::new(),
            removal,
            last_sweep: None,
            stats: EngineStats::default(),
        }
    }

    /// Advance all rules with one processed frame
    pub fn process(&mut self, tracks: &[&Track], sequence: u64, now: DateTime<Utc>) -> Vec<EventCandidate> {
        let mut out = Vec::new();
        let zones = Arc::clone(&self.zones);
        let max_step = secs(self.config.max_dwell_step_secs);

        for track in tracks.iter().filter(|t| t.seen_at(sequence)) {
            if track.class_label != self.config.person_class {
                continue;
            }
            let (Some(det), Some(c)) = (track.last_detection(), track.centroid()) else {
                continue;
            };

            for (idx, zone) in zones.iter().enumerate() {
                if zone.role != ZoneRole::Monitored {
                    continue;
                }
                if zone.contains(&c) {
                    let active = zone.is_active(now);
                    let state = self
                        .pairs
                        .entry((track.id, idx))
                        .or_insert_with(|| TrackZoneState::entered(now, c));
                    if !state.inside {
                        *state = TrackZoneState::entered(now, c);
                    }

                    if active {
                        // unseen stretches count for at most one step
                        let step = (now - state.last_tick).clamp(Duration::zero(), max_step);
                        state.dwell = state.dwell + step;
                    }
                    state.last_tick = now;
                    state.last_seen = now;
                    state.conf_sum += det.confidence;
                    state.conf_count += 1;

                    if let Some(candidate) = Self::check_intrusion(&self.camera_id, &self.config, state, track, zone, active, now) {
                        out.push(candidate);
                    }
                    if let Some(candidate) = Self::check_loitering(&self.camera_id, &self.config, state, track, zone, c, now) {
                        out.push(candidate);
                    }
                } else if let Some(state) = self.pairs.get_mut(&(track.id, idx)) {
                    if state.inside {
                        debug!(
                            camera_id = %self.camera_id,
                            track_id = track.id,
                            zone = %zone.id,
                            dwell_secs = as_secs(state.dwell),
                            "Track left zone"
                        );
                    }
                    state.inside = false;
                    state.dwell = Duration::zero();
                    state.intrusion_fired = false;
                    state.loiter_fired = false;
                    state.last_seen = now;
                }
            }
        }

        out.extend(self.check_crowds(tracks, sequence, now));
        out.extend(self.removal.observe(&self.camera_id, &zones, tracks, sequence, now));

        let sweep_due = self
            .last_sweep
            .map_or(true, |last| now - last >= Duration::seconds(self.config.sweep_interval_secs as i64));
        if sweep_due {
            self.sweep(now);
        }

        for candidate in &out {
            *self.stats.emitted.entry(candidate.event_type.to_string()).or_default() += 1;
            info!(
                camera_id = %self.camera_id,
                event_type = %candidate.event_type,
                track_id = candidate.track_id,
                zone = candidate.zone_id.as_deref().unwrap_or("-"),
                confidence = candidate.confidence,
                "Event candidate"
            );
        }
        out
    }

    fn check_intrusion(
        camera_id: &str,
        config: &EventConfig,
        state: &mut TrackZoneState,
        track: &Track,
        zone: &Zone,
        active: bool,
        now: DateTime<Utc>,
    ) -> Option<EventCandidate> {
        let threshold = secs(config.intrusion_dwell_secs);
        if !active || state.intrusion_fired || state.dwell < threshold {
            return None;
        }
        state.intrusion_fired = true;

        let evidence = if threshold.is_zero() {
            1.0
        } else {
            (as_secs(state.dwell) / as_secs(threshold)).min(1.0) as f32
        };
        let candidate = EventCandidate::new(
            EventType::Intrusion,
            camera_id,
            track.id,
            Some(zone.id.clone()),
            state.mean_confidence() * evidence,
            now,
        )
        .with_meta("zone_name", json!(zone.name))
        .with_meta("dwell_secs", json!(as_secs(state.dwell)))
        .with_meta("class", json!(track.class_label));

        Some(match track.last_detection() {
            Some(det) => candidate.with_bbox(det.bbox),
            None => candidate,
        })
    }

    fn check_loitering(
        camera_id: &str,
        config: &EventConfig,
        state: &mut TrackZoneState,
        track: &Track,
        zone: &Zone,
        c: Point,
        now: DateTime<Utc>,
    ) -> Option<EventCandidate> {
        // moving on re-arms and restarts the clock
        if distance(&c, &state.loiter_anchor) > config.loitering_movement_px {
            state.loiter_anchor = c;
            state.loiter_since = now;
            state.loiter_fired = false;
            return None;
        }

        let duration = now - state.loiter_since;
        if state.loiter_fired || duration < secs(config.loitering_threshold_secs) {
            return None;
        }
        state.loiter_fired = true;

        let candidate = EventCandidate::new(
            EventType::Loitering,
            camera_id,
            track.id,
            Some(zone.id.clone()),
            state.mean_confidence(),
            now,
        )
        .with_meta("zone_name", json!(zone.name))
        .with_meta("duration_secs", json!(as_secs(duration)))
        .with_meta("displacement_px", json!(distance(&c, &state.loiter_anchor)));

        Some(match track.last_detection() {
            Some(det) => candidate.with_bbox(det.bbox),
            None => candidate,
        })
    }

    fn check_crowds(&mut self, tracks: &[&Track], sequence: u64, now: DateTime<Utc>) -> Vec<EventCandidate> {
        let mut out = Vec::new();
        let window = secs(self.config.crowd_window_secs);

        for (idx, zone) in self.zones.iter().enumerate() {
            if zone.role != ZoneRole::Monitored {
                continue;
            }
            let occupants: Vec<&Track> = tracks
                .iter()
                .copied()
                .filter(|t| t.seen_at(sequence) && t.class_label == self.config.person_class)
                .filter(|t| {
                    self.pairs
                        .get(&(t.id, idx))
                        .map_or(false, |s| s.inside && s.last_seen == now)
                })
                .collect();

            if occupants.len() <= self.config.crowd_threshold {
                continue;
            }
            let zs = &mut self.zone_state[idx];
            if zs.last_crowd_emit.map_or(false, |last| now - last < window) {
                continue;
            }
            zs.last_crowd_emit = Some(now);

            let confidence = occupants
                .iter()
                .filter_map(|t| t.last_detection().map(|d| d.confidence))
                .sum::<f32>()
                / occupants.len() as f32;
            let ids: Vec<u64> = occupants.iter().map(|t| t.id).collect();
            let lowest = ids.iter().copied().min().unwrap_or(0);

            out.push(
                EventCandidate::new(
                    EventType::CrowdAnomaly,
                    &self.camera_id,
                    lowest,
                    Some(zone.id.clone()),
                    confidence,
                    now,
                )
                .with_meta("zone_name", json!(zone.name))
                .with_meta("person_count", json!(occupants.len()))
                .with_meta("threshold", json!(self.config.crowd_threshold))
                .with_meta("track_ids", json!(ids)),
            );
        }
        out
    }

    /// Purge state not refreshed within `state_max_age_secs`
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - secs(self.config.state_max_age_secs);
        let before = self.pairs.len();
        self.pairs.retain(|_, s| s.last_seen >= cutoff);
        let purged = before - self.pairs.len() + self.removal.purge(cutoff);

        self.last_sweep = Some(now);
        self.stats.purged += purged as u64;
        if purged > 0 {
            debug!(camera_id = %self.camera_id, purged, "Swept stale event state");
        }
        purged
    }

    /// Accumulated active dwell of a track in a zone; zero when outside
    pub fn dwell(&self, track_id: u64, zone_id: &str) -> Duration {
        self.zones
            .iter()
            .position(|z| z.id == zone_id)
            .and_then(|idx| self.pairs.get(&(track_id, idx)))
            .filter(|s| s.inside)
            .map_or(Duration::zero(), |s| s.dwell)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tracked_pairs: self.pairs.len(),
            armed_objects: self.armed_objects(),
            ..self.stats.clone()
        }
    }

    /// Objects currently watched for removal
    pub fn armed_objects(&self) -> usize {
        self.removal.armed_count()
    }

    pub fn zones(&self) -> &Arc<Vec<Zone>> {
        &self.zones
    }

    /// Forget every track-derived state
    pub fn reset(&mut self) {
        self.pairs.clear();
        self.removal.reset();
        self.zone_state = vec![ZoneState::default(); self.zones.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleConfig, WindowConfig, ZoneConfig};
    use crate::core::Detection;
    use crate::tracking::{Tracker, TrackerSettings};
    use chrono::TimeZone;

    fn zone(id: &str, role: ZoneRole, x1: f32, y1: f32, x2: f32, y2: f32) -> Zone {
        Zone::from_config(&ZoneConfig {
            id: id.to_string(),
            name: String::new(),
            role,
            polygon: vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]],
            schedule: None,
        })
        .unwrap()
    }

    fn det(label: &str, x: f32, y: f32, conf: f32) -> Detection {
        Detection::new(0, label, conf, BBox::new(x - 10.0, y - 10.0, x + 10.0, y + 10.0))
    }

    fn base() -> DateTime<Utc> {
        // Monday
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    /// Drive tracker and engine at a fixed frame interval
    struct Harness {
        tracker: Tracker,
        engine: EventEngine,
        seq: u64,
        now: DateTime<Utc>,
        step: Duration,
        emitted: Vec<EventCandidate>,
    }

    impl Harness {
        fn new(config: EventConfig, zones: Vec<Zone>, fps: i64) -> Self {
            Self {
                tracker: Tracker::new(TrackerSettings::default()),
                engine: EventEngine::new("cam", config, Arc::new(zones)),
                seq: 0,
                now: base(),
                step: Duration::milliseconds(1000 / fps),
                emitted: Vec::new(),
            }
        }

        fn frame(&mut self, detections: &[Detection]) {
            let tracks = self.tracker.update(self.seq, detections, self.now);
            let out = self.engine.process(&tracks, self.seq, self.now);
            self.emitted.extend(out);
            self.seq += 1;
            self.now = self.now + self.step;
        }

        fn count(&self, event_type: EventType) -> usize {
            self.emitted.iter().filter(|c| c.event_type == event_type).count()
        }
    }

    #[test]
    fn test_continuous_dwell_emits_one_intrusion() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("door", ZoneRole::Monitored, 0.0, 0.0, 200.0, 200.0)], 5);
        for _ in 0..50 {
            h.frame(&[det("person", 100.0, 100.0, 0.9)]);
        }
        assert_eq!(h.count(EventType::Intrusion), 1);
        let c = h.emitted.iter().find(|c| c.event_type == EventType::Intrusion).unwrap();
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.zone_id.as_deref(), Some("door"));
        assert!((c.confidence - 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_dwell_monotonic_and_reset_on_exit() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("door", ZoneRole::Monitored, 0.0, 0.0, 200.0, 200.0)], 5);
        let mut last = Duration::zero();
        for _ in 0..10 {
            h.frame(&[det("person", 100.0, 100.0, 0.9)]);
            let d = h.engine.dwell(1, "door");
            assert!(d >= last);
            last = d;
        }
        assert!(last > Duration::zero());

        h.frame(&[det("person", 240.0, 100.0, 0.9)]);
        assert_eq!(h.engine.dwell(1, "door"), Duration::zero());
    }

    #[test]
    fn test_unseen_gap_adds_bounded_dwell() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("door", ZoneRole::Monitored, 0.0, 0.0, 200.0, 200.0)], 5);
        h.frame(&[det("person", 100.0, 100.0, 0.9)]);
        // ten seconds of missed detections, track kept
        for _ in 0..50 {
            h.frame(&[]);
        }
        h.frame(&[det("person", 100.0, 100.0, 0.9)]);

        assert_eq!(h.engine.dwell(1, "door"), Duration::seconds(2));
        assert_eq!(h.count(EventType::Intrusion), 0);
    }

    #[test]
    fn test_intrusion_rearms_after_reentry() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("door", ZoneRole::Monitored, 0.0, 0.0, 200.0, 200.0)], 5);
        for _ in 0..25 {
            h.frame(&[det("person", 150.0, 100.0, 0.9)]);
        }
        h.frame(&[det("person", 250.0, 100.0, 0.9)]);
        for _ in 0..25 {
            h.frame(&[det("person", 150.0, 100.0, 0.9)]);
        }
        assert_eq!(h.count(EventType::Intrusion), 2);
    }

    #[test]
    fn test_inactive_schedule_suppresses_intrusion() {
        let mut night = zone("yard", ZoneRole::Monitored, 0.0, 0.0, 200.0, 200.0);
        night.schedule = Some(
            Schedule::from_config(&ScheduleConfig {
                utc_offset_minutes: 0,
                windows: vec![WindowConfig { days: vec![], start: "22:00".into(), end: "06:00".into() }],
            })
            .unwrap(),
        );
        let mut h = Harness::new(EventConfig::default(), vec![night], 5);
        for _ in 0..50 {
            h.frame(&[det("person", 100.0, 100.0, 0.9)]);
        }
        assert_eq!(h.count(EventType::Intrusion), 0);
        assert_eq!(h.engine.dwell(1, "yard"), Duration::zero());
    }

    #[test]
    fn test_stationary_person_loiters_once() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("lobby", ZoneRole::Monitored, 0.0, 0.0, 500.0, 500.0)], 1);
        for i in 0..90 {
            let jitter = (i % 3) as f32 * 5.0;
            h.frame(&[det("person", 200.0 + jitter, 200.0, 0.8)]);
        }
        assert_eq!(h.count(EventType::Loitering), 1);
    }

    #[test]
    fn test_moving_person_does_not_loiter() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("lobby", ZoneRole::Monitored, 0.0, 0.0, 500.0, 500.0)], 1);
        // 150px over 70 seconds
        for i in 0..=70 {
            h.frame(&[det("person", 100.0 + i as f32 * 150.0 / 70.0, 200.0, 0.8)]);
        }
        assert_eq!(h.count(EventType::Loitering), 0);
    }

    #[test]
    fn test_crowd_at_most_once_per_window() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("hall", ZoneRole::Monitored, 0.0, 0.0, 2000.0, 2000.0)], 1);
        let crowd: Vec<Detection> = (0..11).map(|i| det("person", 100.0 + i as f32 * 160.0, 500.0, 0.85)).collect();
        for _ in 0..120 {
            h.frame(&crowd);
        }

        let times: Vec<DateTime<Utc>> = h
            .emitted
            .iter()
            .filter(|c| c.event_type == EventType::CrowdAnomaly)
            .map(|c| c.timestamp)
            .collect();
        assert_eq!(times.len(), 4);
        assert!(times.windows(2).all(|w| w[1] - w[0] >= Duration::seconds(30)));

        let first = h.emitted.iter().find(|c| c.event_type == EventType::CrowdAnomaly).unwrap();
        assert_eq!(first.track_id, 1);
        assert_eq!(first.metadata["person_count"], json!(11));
    }

    #[test]
    fn test_ten_people_is_not_a_crowd() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("hall", ZoneRole::Monitored, 0.0, 0.0, 2000.0, 2000.0)], 1);
        let crowd: Vec<Detection> = (0..10).map(|i| det("person", 100.0 + i as f32 * 160.0, 500.0, 0.85)).collect();
        for _ in 0..40 {
            h.frame(&crowd);
        }
        assert_eq!(h.count(EventType::CrowdAnomaly), 0);
    }

    fn removal_zones() -> Vec<Zone> {
        vec![
            zone("shelf", ZoneRole::Protected, 0.0, 0.0, 100.0, 100.0),
            zone("exit", ZoneRole::Exit, 800.0, 0.0, 1000.0, 200.0),
        ]
    }

    #[test]
    fn test_removal_pattern_detected() {
        let mut h = Harness::new(EventConfig::default(), removal_zones(), 5);
        // bag rests on the shelf with a person next to it
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        // bag vanishes, person walks to the exit
        for i in 0..20 {
            let x = 120.0 + i as f32 * 40.0;
            h.frame(&[det("person", x.min(900.0), 60.0, 0.85)]);
        }
        assert_eq!(h.count(EventType::RemovalPattern), 1);
        let c = h.emitted.iter().find(|c| c.event_type == EventType::RemovalPattern).unwrap();
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.zone_id.as_deref(), Some("shelf"));
        assert!((c.confidence - 0.85).abs() < 1e-4);
        assert_eq!(c.metadata["exit_zone_id"], json!("exit"));
    }

    #[test]
    fn test_moved_object_is_not_removed() {
        let mut h = Harness::new(EventConfig::default(), removal_zones(), 5);
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        // bag carried off the shelf and set down in view
        for _ in 0..5 {
            h.frame(&[det("backpack", 150.0, 50.0, 0.9), det("person", 160.0, 60.0, 0.85)]);
        }
        for i in 0..20 {
            h.frame(&[det("backpack", 150.0, 50.0, 0.9), det("person", (200.0 + i as f32 * 40.0).min(900.0), 60.0, 0.85)]);
        }
        assert_eq!(h.count(EventType::RemovalPattern), 0);
    }

    #[test]
    fn test_vanish_without_exit_is_ignored() {
        let mut h = Harness::new(EventConfig::default(), removal_zones(), 5);
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        for _ in 0..100 {
            h.frame(&[det("person", 120.0, 60.0, 0.85)]);
        }
        assert_eq!(h.count(EventType::RemovalPattern), 0);
    }

    #[test]
    fn test_removal_counts_person_near_exit() {
        let mut h = Harness::new(EventConfig::default(), removal_zones(), 5);
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        // stops 30px short of the exit polygon
        for i in 0..20 {
            let x = 120.0 + i as f32 * 40.0;
            h.frame(&[det("person", x.min(770.0), 60.0, 0.85)]);
        }
        assert_eq!(h.count(EventType::RemovalPattern), 1);
    }

    #[test]
    fn test_removal_ignores_person_far_from_exit() {
        let mut h = Harness::new(EventConfig::default(), removal_zones(), 5);
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        for i in 0..20 {
            let x = 120.0 + i as f32 * 40.0;
            h.frame(&[det("person", x.min(700.0), 60.0, 0.85)]);
        }
        assert_eq!(h.count(EventType::RemovalPattern), 0);
    }

    #[test]
    fn test_object_back_in_place_is_watched_again() {
        let mut h = Harness::new(EventConfig::default(), removal_zones(), 5);
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        assert_eq!(h.engine.armed_objects(), 1);
        for i in 0..20 {
            let x = 120.0 + i as f32 * 40.0;
            h.frame(&[det("person", x.min(900.0), 60.0, 0.85)]);
        }
        assert_eq!(h.count(EventType::RemovalPattern), 1);
        assert_eq!(h.engine.armed_objects(), 0);

        // it was only hidden: same track back on the shelf, someone beside it
        for _ in 0..15 {
            h.frame(&[det("backpack", 50.0, 50.0, 0.9), det("person", 120.0, 60.0, 0.85)]);
        }
        assert_eq!(h.engine.armed_objects(), 1);
        for i in 0..20 {
            let x = 120.0 + i as f32 * 40.0;
            h.frame(&[det("person", x.min(900.0), 60.0, 0.85)]);
        }

        let removals: Vec<&EventCandidate> = h
            .emitted
            .iter()
            .filter(|c| c.event_type == EventType::RemovalPattern)
            .collect();
        assert_eq!(removals.len(), 2);
        assert_eq!(removals[0].track_id, removals[1].track_id);
    }

    #[test]
    fn test_sweep_purges_stale_pairs() {
        let mut h = Harness::new(EventConfig::default(), vec![zone("door", ZoneRole::Monitored, 0.0, 0.0, 200.0, 200.0)], 5);
        h.frame(&[det("person", 100.0, 100.0, 0.9)]);
        assert_eq!(h.engine.stats().tracked_pairs, 1);
        let later = h.now + Duration::seconds(31);
        assert!(h.engine.sweep(later) >= 1);
        assert_eq!(h.engine.stats().tracked_pairs, 0);
    }
}
