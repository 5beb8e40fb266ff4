// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Zones of interest and their activity schedules

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::{ScheduleConfig, WindowConfig, ZoneConfig};
use crate::core::Point;
use crate::error::{PipelineError, Result};

/// What a zone is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneRole {
    /// Intrusion, loitering and crowd rules
    #[default]
    Monitored,
    /// Objects resting here are watched for removal
    Protected,
    /// Way out, used to correlate removals with a person leaving
    Exit,
}

/// Daily time window
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Empty means every day
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Window {
    fn day_matches(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    /// `start == end` covers the whole day; `start > end` runs past
    /// midnight and belongs to the day it started on.
    fn contains(&self, day: Weekday, time: NaiveTime) -> bool {
        if self.start == self.end {
            self.day_matches(day)
        } else if self.start < self.end {
            self.day_matches(day) && time >= self.start && time < self.end
        } else {
            (self.day_matches(day) && time >= self.start)
                || (self.day_matches(day.pred()) && time < self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub offset: FixedOffset,
    pub windows: Vec<Window>,
}

impl Schedule {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "utc offset of {} minutes is out of range",
                config.utc_offset_minutes
            ))
        })?;
        let windows = config
            .windows
            .iter()
            .map(parse_window)
            .collect::<Result<Vec<_>>>()?;
        if windows.is_empty() {
            return Err(PipelineError::Configuration("schedule has no windows".into()));
        }
        Ok(Self { offset, windows })
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset);
        let (day, time) = (local.weekday(), local.time());
        self.windows.iter().any(|w| w.contains(day, time))
    }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| PipelineError::Configuration(format!("invalid time '{}'", value)))
}

fn parse_day(value: &str) -> Result<Weekday> {
    value
        .parse::<Weekday>()
        .map_err(|_| PipelineError::Configuration(format!("invalid weekday '{}'", value)))
}

fn parse_window(config: &WindowConfig) -> Result<Window> {
    Ok(Window {
        days: config.days.iter().map(|d| parse_day(d)).collect::<Result<Vec<_>>>()?,
        start: parse_time(&config.start)?,
        end: parse_time(&config.end)?,
    })
}

/// Named polygon with an optional schedule. Read-only once compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub role: ZoneRole,
    pub polygon: Vec<Point>,
    pub schedule: Option<Schedule>,
}

impl Zone {
    pub fn from_config(config: &ZoneConfig) -> Result<Self> {
        if config.id.trim().is_empty() {
            return Err(PipelineError::Configuration("zone id must not be empty".into()));
        }
        if config.polygon.len() < 3 {
            return Err(PipelineError::Configuration(format!(
                "zone '{}' needs at least 3 vertices, has {}",
                config.id,
                config.polygon.len()
            )));
        }
        if config.polygon.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PipelineError::Configuration(format!(
                "zone '{}' has non-finite coordinates",
                config.id
            )));
        }

        let schedule = match &config.schedule {
            Some(s) => Some(Schedule::from_config(s).map_err(|e| {
                PipelineError::Configuration(format!("zone '{}': {}", config.id, e))
            })?),
            None => None,
        };

        Ok(Self {
            id: config.id.clone(),
            name: if config.name.is_empty() { config.id.clone() } else { config.name.clone() },
            role: config.role,
            polygon: config.polygon.iter().map(|[x, y]| Point::new(*x, *y)).collect(),
            schedule,
        })
    }

    /// Ray casting point-in-polygon
    pub fn contains(&self, p: &Point) -> bool {
        let n = self.polygon.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (&self.polygon[i], &self.polygon[j]);
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.schedule.as_ref().map_or(true, |s| s.is_active(at))
    }

    /// Shortest distance from `p` to the polygon, zero inside
    pub fn distance_to(&self, p: &Point) -> f32 {
        if self.contains(p) {
            return 0.0;
        }
        let n = self.polygon.len();
        (0..n)
            .map(|i| segment_distance(p, &self.polygon[i], &self.polygon[(i + 1) % n]))
            .fold(f32::INFINITY, f32::min)
    }
}

fn segment_distance(p: &Point, a: &Point, b: &Point) -> f32 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 == 0.0 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn zone_config(polygon: Vec<[f32; 2]>, schedule: Option<ScheduleConfig>) -> ZoneConfig {
        ZoneConfig {
            id: "z".to_string(),
            name: String::new(),
            role: ZoneRole::Monitored,
            polygon,
            schedule,
        }
    }

    fn window(days: &[&str], start: &str, end: &str) -> WindowConfig {
        WindowConfig {
            days: days.iter().map(|d| d.to_string()).collect(),
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    #[test]
    fn test_contains_concave_polygon() {
        // L shape
        let zone = Zone::from_config(&zone_config(
            vec![[0.0, 0.0], [100.0, 0.0], [100.0, 40.0], [40.0, 40.0], [40.0, 100.0], [0.0, 100.0]],
            None,
        ))
        .unwrap();
        assert!(zone.contains(&Point::new(20.0, 80.0)));
        assert!(zone.contains(&Point::new(80.0, 20.0)));
        assert!(!zone.contains(&Point::new(80.0, 80.0)));
        assert!(!zone.contains(&Point::new(-1.0, 50.0)));
    }

    #[test]
    fn test_distance_to() {
        let zone = Zone::from_config(&zone_config(
            vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]],
            None,
        ))
        .unwrap();
        assert_eq!(zone.distance_to(&Point::new(5.0, 5.0)), 0.0);
        assert!((zone.distance_to(&Point::new(13.0, 14.0)) - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_schedule_daytime_window() {
        let schedule = Schedule::from_config(&ScheduleConfig {
            utc_offset_minutes: 0,
            windows: vec![window(&["mon", "tue"], "09:00", "17:30")],
        })
        .unwrap();
        // 2024-01-01 is a Monday
        assert!(schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()));
        assert!(!schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 1, 17, 30, 0).unwrap()));
        assert!(!schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_schedule_overnight_belongs_to_start_day() {
        let schedule = Schedule::from_config(&ScheduleConfig {
            utc_offset_minutes: 0,
            windows: vec![window(&["fri"], "22:00", "06:00")],
        })
        .unwrap();
        // Friday 2024-01-05 23:00 and Saturday 05:00 active, Friday 05:00 not
        assert!(schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 5, 23, 0, 0).unwrap()));
        assert!(schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 6, 5, 0, 0).unwrap()));
        assert!(!schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 5, 5, 0, 0).unwrap()));
    }

    #[test]
    fn test_schedule_applies_offset() {
        let schedule = Schedule::from_config(&ScheduleConfig {
            utc_offset_minutes: -180,
            windows: vec![window(&[], "08:00", "18:00")],
        })
        .unwrap();
        // 10:00 UTC is 07:00 local
        assert!(!schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()));
        assert!(schedule.is_active(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let bad_time = zone_config(
            vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            Some(ScheduleConfig { utc_offset_minutes: 0, windows: vec![window(&[], "25:00", "06:00")] }),
        );
        assert!(Zone::from_config(&bad_time).is_err());

        let bad_day = zone_config(
            vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            Some(ScheduleConfig { utc_offset_minutes: 0, windows: vec![window(&["someday"], "01:00", "06:00")] }),
        );
        assert!(Zone::from_config(&bad_day).is_err());
    }
}
