// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Frame pacing and the drop-oldest hand-off between stages

use std::collections::VecDeque;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::Frame;

struct QueueInner<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

/// Bounded single-consumer queue. A push into a full queue evicts the
/// oldest entry, so the producer never waits.
pub struct DropOldestQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.max(1)),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the evicted entry, if any
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Some(item);
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.dropped += 1;
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next entry; `None` once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Open the queue again after a restart
    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        inner.closed = false;
        inner.items.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

/// Paces frames to the target processing rate before the hand-off queue
pub struct FrameSampler {
    min_interval: Option<chrono::Duration>,
    last_emitted: Option<(u64, DateTime<Utc>)>,
    queue: Arc<DropOldestQueue<Frame>>,
    skipped: u64,
}

impl FrameSampler {
    /// `fps <= 0` disables pacing
    pub fn new(fps: f64, queue: Arc<DropOldestQueue<Frame>>) -> Self {
        let min_interval = if fps > 0.0 && fps.is_finite() {
            Some(chrono::Duration::microseconds((1_000_000.0 / fps) as i64))
        } else {
            None
        };
        Self {
            min_interval,
            last_emitted: None,
            queue,
            skipped: 0,
        }
    }

    /// Admit or skip a frame. Never blocks.
    pub fn offer(&mut self, frame: Frame) -> bool {
        if let Some((seq, ts)) = self.last_emitted {
            let out_of_order = frame.sequence <= seq || frame.captured_at <= ts;
            let too_soon = self
                .min_interval
                .map_or(false, |interval| frame.captured_at - ts < interval);
            if out_of_order || too_soon {
                self.skipped += 1;
                return false;
            }
        }

        self.last_emitted = Some((frame.sequence, frame.captured_at));
        self.queue.push(frame);
        true
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn close(&self) {
        self.queue.close();
    }
}
