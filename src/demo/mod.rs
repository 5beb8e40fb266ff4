// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Simulated camera and detector for demo/testing
//!
//! The synthetic scene paints each actor as a flat rectangle whose colour
//! encodes its class and identity (blue channel saturated, red channel the
//! class code, green channel the actor index). The simulated backend reads
//! those rectangles back, so the whole pipeline runs end to end without
//! ffmpeg or a model file.

use std::collections::BTreeMap;
use std::time::Duration;
use async_trait::async_trait;
use ndarray::Array3;
use parking_lot::Mutex;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::{CameraConfig, ZoneConfig};
use crate::core::{BBox, Detection};
use crate::detection::InferenceBackend;
use crate::error::Result;
use crate::events::ZoneRole;
use crate::stream::{StreamConnector, StreamSession};

/// Scripted scene length in seconds
pub const SCENE_CYCLE_SECS: f64 = 120.0;

const MARKER: u8 = 255;

/// Class palette: (red code, label, COCO class id)
const PALETTE: [(u8, &str, usize); 4] = [
    (30, "person", 0),
    (50, "backpack", 24),
    (70, "handbag", 26),
    (90, "suitcase", 28),
];

fn class_code(label: &str) -> u8 {
    PALETTE
        .iter()
        .find(|(_, l, _)| *l == label)
        .map(|(code, _, _)| *code)
        .unwrap_or(PALETTE[0].0)
}

#[derive(Debug, Clone, Copy)]
enum Motion {
    /// Back and forth between two points over `period` seconds
    Patrol { from: (f32, f32), to: (f32, f32), period: f64 },
    /// Small drift around a point
    Wander { center: (f32, f32), radius: f32 },
    /// At rest, present while the cycle time is below `until`
    Resting { at: (f32, f32), until: f64 },
    /// Walks `from` -> `via` -> `to` during `[start, end)` of the cycle
    Visit { from: (f32, f32), via: (f32, f32), to: (f32, f32), start: f64, end: f64 },
}

#[derive(Debug, Clone, Copy)]
struct Actor {
    label: &'static str,
    size: (f32, f32),
    motion: Motion,
}

/// Scene with a passer-by, a loiterer, a bag and someone who takes it
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    width: usize,
    height: usize,
    actors: Vec<Actor>,
}

impl SyntheticScene {
    pub fn new(width: usize, height: usize) -> Self {
        let (w, h) = (width as f32, height as f32);
        let bag = (0.70 * w, 0.78 * h);
        let actors = vec![
            Actor {
                label: "person",
                size: (0.05 * w, 0.22 * h),
                motion: Motion::Patrol { from: (0.05 * w, 0.45 * h), to: (0.60 * w, 0.45 * h), period: 40.0 },
            },
            Actor {
                label: "person",
                size: (0.05 * w, 0.22 * h),
                motion: Motion::Wander { center: (0.25 * w, 0.30 * h), radius: 0.03 * w },
            },
            Actor {
                label: "backpack",
                size: (0.04 * w, 0.07 * h),
                motion: Motion::Resting { at: bag, until: 75.0 },
            },
            Actor {
                label: "person",
                size: (0.05 * w, 0.22 * h),
                motion: Motion::Visit {
                    from: (0.85 * w, 0.25 * h),
                    via: (bag.0, bag.1 - 0.12 * h),
                    to: (0.95 * w, 0.60 * h),
                    start: 60.0,
                    end: 85.0,
                },
            },
        ];
        Self { width, height, actors }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn lerp(a: (f32, f32), b: (f32, f32), t: f32) -> (f32, f32) {
        (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t)
    }

    /// Centre of an actor at scene time `t`, or None while off screen
    fn position(actor: &Actor, t: f64, jitter: (f32, f32)) -> Option<(f32, f32)> {
        let cycle = t.rem_euclid(SCENE_CYCLE_SECS);
        match actor.motion {
            Motion::Patrol { from, to, period } => {
                let phase = (t.rem_euclid(period) / period) as f32;
                let k = if phase < 0.5 { phase * 2.0 } else { 2.0 - phase * 2.0 };
                Some(Self::lerp(from, to, k))
            }
            Motion::Wander { center, radius } => {
                let (s, c) = ((t * 0.7).sin() as f32, (t * 0.45).cos() as f32);
                Some((center.0 + s * radius + jitter.0, center.1 + c * radius * 0.5 + jitter.1))
            }
            Motion::Resting { at, until } => (cycle < until).then_some(at),
            Motion::Visit { from, via, to, start, end } => {
                if cycle < start || cycle >= end {
                    return None;
                }
                let k = ((cycle - start) / (end - start)) as f32;
                Some(if k < 0.6 {
                    Self::lerp(from, via, k / 0.6)
                } else {
                    Self::lerp(via, to, (k - 0.6) / 0.4)
                })
            }
        }
    }

    /// Render the scene at time `t`
    pub fn render(&self, t: f64, frame_index: u64, rng: &mut StdRng) -> Array3<u8> {
        let shimmer = (frame_index % 16) as usize;
        let mut image = Array3::from_shape_fn((self.height, self.width, 3), |(y, x, c)| match c {
            0 => (70 + (x * 7 + y * 3 + shimmer) % 30) as u8,
            1 => (80 + (x + y * 5) % 25) as u8,
            _ => (60 + (x + y) % 40) as u8,
        });

        for (idx, actor) in self.actors.iter().enumerate() {
            let jitter = (
                rng.sample::<f32, _>(StandardNormal) * 1.5,
                rng.sample::<f32, _>(StandardNormal) * 1.5,
            );
            let Some((cx, cy)) = Self::position(actor, t, jitter) else { continue };
            let (hw, hh) = (actor.size.0 / 2.0, actor.size.1 / 2.0);
            let x1 = (cx - hw).max(0.0) as usize;
            let y1 = (cy - hh).max(0.0) as usize;
            let x2 = ((cx + hw).max(0.0) as usize).min(self.width);
            let y2 = ((cy + hh).max(0.0) as usize).min(self.height);
            let code = class_code(actor.label);
            for y in y1..y2 {
                for x in x1..x2 {
                    image[[y, x, 0]] = code;
                    image[[y, x, 1]] = idx as u8;
                    image[[y, x, 2]] = MARKER;
                }
            }
        }
        image
    }
}

/// Connector producing the synthetic scene in real time
pub struct SyntheticConnector {
    scene: SyntheticScene,
    fps: f64,
    seed: Option<u64>,
}

impl SyntheticConnector {
    pub fn new(width: usize, height: usize, fps: f64) -> Self {
        Self {
            scene: SyntheticScene::new(width, height),
            fps: if fps > 0.0 { fps } else { 10.0 },
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[async_trait]
impl StreamConnector for SyntheticConnector {
    async fn connect(&self, _camera_id: &str) -> Result<Box<dyn StreamSession>> {
        let mut ticker = interval(Duration::from_secs_f64(1.0 / self.fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Box::new(SyntheticSession {
            scene: self.scene.clone(),
            fps: self.fps,
            frame_index: 0,
            ticker,
            rng,
        }))
    }
}

pub struct SyntheticSession {
    scene: SyntheticScene,
    fps: f64,
    frame_index: u64,
    ticker: Interval,
    rng: StdRng,
}

#[async_trait]
impl StreamSession for SyntheticSession {
    async fn next_frame(&mut self) -> Result<Array3<u8>> {
        self.ticker.tick().await;
        let t = self.frame_index as f64 / self.fps;
        let image = self.scene.render(t, self.frame_index, &mut self.rng);
        self.frame_index += 1;
        Ok(image)
    }

    async fn close(&mut self) {}
}

/// Reads the synthetic scene's marker rectangles back as detections
pub struct SimulatedBackend {
    rng: Mutex<StdRng>,
    miss_rate: f64,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            miss_rate: 0.02,
        }
    }

    /// Deterministic, never misses
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            miss_rate: 0.0,
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn infer(&self, image: &Array3<u8>) -> Result<Vec<Detection>> {
        let (h, w, _) = image.dim();
        // (code, actor) -> (x1, y1, x2, y2)
        let mut regions: BTreeMap<(u8, u8), (usize, usize, usize, usize)> = BTreeMap::new();
        for y in 0..h {
            for x in 0..w {
                if image[[y, x, 2]] != MARKER {
                    continue;
                }
                let key = (image[[y, x, 0]], image[[y, x, 1]]);
                let r = regions.entry(key).or_insert((x, y, x, y));
                r.0 = r.0.min(x);
                r.1 = r.1.min(y);
                r.2 = r.2.max(x);
                r.3 = r.3.max(y);
            }
        }

        let mut rng = self.rng.lock();
        let mut detections = Vec::new();
        for ((code, _), (x1, y1, x2, y2)) in regions {
            let Some((_, label, class_id)) = PALETTE.iter().find(|(c, _, _)| *c == code) else {
                continue;
            };
            if self.miss_rate > 0.0 && rng.gen_bool(self.miss_rate) {
                continue;
            }
            let noise: f32 = rng.sample(StandardNormal);
            let confidence = (0.86 + 0.04 * noise).clamp(0.55, 0.99);
            let bbox = BBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32);
            detections.push(Detection::new(*class_id, label, confidence, bbox));
        }
        Ok(detections)
    }
}

/// Camera config wired to the synthetic scene's layout
pub fn demo_camera(id: &str, width: u32, height: u32, fps: f64) -> CameraConfig {
    let (w, h) = (width as f32, height as f32);
    let rect = |x1: f32, y1: f32, x2: f32, y2: f32| vec![[x1 * w, y1 * h], [x2 * w, y1 * h], [x2 * w, y2 * h], [x1 * w, y2 * h]];

    CameraConfig {
        id: id.to_string(),
        name: format!("Demo {}", id),
        url: format!("synthetic://{}", id),
        enabled: true,
        fps,
        width: Some(width),
        height: Some(height),
        zones: vec![
            ZoneConfig {
                id: "courtyard".to_string(),
                name: "Courtyard".to_string(),
                role: ZoneRole::Monitored,
                polygon: rect(0.0, 0.1, 0.5, 0.7),
                schedule: None,
            },
            ZoneConfig {
                id: "storage".to_string(),
                name: "Storage".to_string(),
                role: ZoneRole::Protected,
                polygon: rect(0.6, 0.65, 0.8, 0.95),
                schedule: None,
            },
            ZoneConfig {
                id: "gate".to_string(),
                name: "Gate".to_string(),
                role: ZoneRole::Exit,
                polygon: rect(0.88, 0.4, 1.0, 0.8),
                schedule: None,
            },
        ],
        ..CameraConfig::default()
    }
}
