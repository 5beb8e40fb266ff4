// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! RTSP transport through an ffmpeg child process
//!
//! ffmpeg decodes and rescales to the canonical frame size and writes packed
//! rgb24 to stdout. The child is spawned with `kill_on_drop` so dropping a
//! session always takes the process down with it.

use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use ndarray::Array3;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{StreamConnector, StreamSession};
use crate::error::{PipelineError, Result};

/// Resolution used when ffprobe cannot tell us anything
pub const FALLBACK_SIZE: (u32, u32) = (1280, 720);

/// What ffprobe reported about the source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

/// Parse `ffprobe -of default=noprint_wrappers=1` output
pub fn parse_source_info(output: &str) -> Option<SourceInfo> {
    let mut width = None;
    let mut height = None;
    let mut fps = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "width" => width = value.parse::<u32>().ok(),
            "height" => height = value.parse::<u32>().ok(),
            "r_frame_rate" => {
                fps = match value.split_once('/') {
                    Some((num, den)) => match (num.parse::<f64>(), den.parse::<f64>()) {
                        (Ok(num), Ok(den)) if den > 0.0 => Some(num / den),
                        _ => None,
                    },
                    None => value.parse().ok(),
                };
            }
            _ => {}
        }
    }

    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(SourceInfo { width: w, height: h, fps }),
        _ => None,
    }
}

/// Builds ffmpeg sessions for one camera
pub struct FfmpegConnector {
    url: String,
    target_size: Option<(u32, u32)>,
    ffmpeg_path: String,
    ffprobe_path: String,
    inspect_timeout: Duration,
}

impl FfmpegConnector {
    pub fn new(url: &str, target_size: Option<(u32, u32)>) -> Self {
        Self {
            url: url.to_string(),
            target_size,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            inspect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_binaries(mut self, ffmpeg: &str, ffprobe: &str) -> Self {
        self.ffmpeg_path = ffmpeg.to_string();
        self.ffprobe_path = ffprobe.to_string();
        self
    }

    async fn inspect_source(&self, camera_id: &str) -> Option<SourceInfo> {
        let child = Command::new(&self.ffprobe_path)
            .args([
                "-v", "error",
                "-select_streams", "v:0",
                "-show_entries", "stream=width,height,r_frame_rate",
                "-of", "default=noprint_wrappers=1",
            ])
            .arg(&self.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(camera_id = %camera_id, "Failed to spawn ffprobe: {}", e);
                return None;
            }
        };

        match tokio::time::timeout(self.inspect_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                parse_source_info(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(output)) => {
                warn!(
                    camera_id = %camera_id,
                    "ffprobe failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Ok(Err(e)) => {
                warn!(camera_id = %camera_id, "ffprobe error: {}", e);
                None
            }
            Err(_) => {
                warn!(camera_id = %camera_id, "ffprobe timed out, process killed");
                None
            }
        }
    }

    fn output_size(&self, source: Option<SourceInfo>) -> (u32, u32) {
        match (self.target_size, source) {
            (Some(size), _) => size,
            (None, Some(p)) => (p.width, p.height),
            (None, None) => FALLBACK_SIZE,
        }
    }

    fn command(&self, width: u32, height: u32) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "warning", "-rtsp_transport", "tcp", "-i"])
            .arg(&self.url)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-vf", &format!("scale={}:{}", width, height)])
            .args(["-an", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl StreamConnector for FfmpegConnector {
    async fn connect(&self, camera_id: &str) -> Result<Box<dyn StreamSession>> {
        let source = self.inspect_source(camera_id).await;
        let (width, height) = self.output_size(source);

        match source {
            Some(p) => info!(
                camera_id = %camera_id,
                "Source {}x{} @ {:.1} fps, output {}x{}",
                p.width, p.height, p.fps.unwrap_or(0.0), width, height
            ),
            None => warn!(camera_id = %camera_id, "Source inspection failed, output {}x{}", width, height),
        }

        let mut child = self
            .command(width, height)
            .spawn()
            .map_err(|e| PipelineError::stream_unavailable(camera_id, format!("spawn ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::stream_unavailable(camera_id, "ffmpeg stdout not captured"))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let camera_id = camera_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(camera_id = %camera_id, "ffmpeg: {}", line);
                }
            })
        });

        Ok(Box::new(FfmpegSession {
            camera_id: camera_id.to_string(),
            child,
            stdout,
            stderr_task,
            width: width as usize,
            height: height as usize,
        }))
    }
}

/// A running ffmpeg child
pub struct FfmpegSession {
    camera_id: String,
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<()>>,
    width: usize,
    height: usize,
}

#[async_trait]
impl StreamSession for FfmpegSession {
    async fn next_frame(&mut self) -> Result<Array3<u8>> {
        let mut buf = vec![0u8; self.width * self.height * 3];
        self.stdout.read_exact(&mut buf).await.map_err(|e| {
            PipelineError::stream_unavailable(&self.camera_id, format!("ffmpeg output ended: {}", e))
        })?;

        Array3::from_shape_vec((self.height, self.width, 3), buf)
            .map_err(|e| PipelineError::Decode(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(camera_id = %self.camera_id, "ffmpeg already exited: {}", e);
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
