// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::time::{Duration, Instant};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

/// Counts presented frames and reports a rate once per window.
#[derive(Debug)]
pub struct FpsCounter {
    window: Duration,
    frames: u32,
    window_start: Instant,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            frames: 0,
            window_start: now,
        }
    }

    pub fn frame(&mut self) {
        self.frames = self.frames.saturating_add(1);
    }

    /// Frames counted so far in the current window.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Returns the frame count of the elapsed window and starts a new one,
    /// or `None` while the window is still open.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        if now.duration_since(self.window_start) < self.window {
            return None;
        }
        let n = self.frames;
        self.frames = 0;
        self.window_start = now;
        Some(n)
    }

    /// Forget the current window, e.g. while rendering is paused.
    pub fn reset(&mut self, now: Instant) {
        self.frames = 0;
        self.window_start = now;
    }
}
