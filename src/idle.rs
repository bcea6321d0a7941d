//! Arm idle detection and camera-frame gating.
//!
//! Tracks the recency of arm samples against an optional idle timeout. While
//! idle, camera frames may be dropped; exactly one "pausing" event is logged
//! per idle span and exactly one "resumed" event when samples return.

use std::time::{Duration, Instant};

/// What to do with an incoming camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Decode and forward to the sink.
    Forward,
    /// Drop without decoding the payload.
    Drop {
        /// True for the first dropped frame of this idle span; the caller
        /// logs the "pausing" event exactly once.
        first_of_span: bool,
    },
}

/// Recency tracker for arm samples.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    /// Absent disables idle detection entirely.
    timeout: Option<Duration>,
    drop_camera_when_idle: bool,
    last_sample: Option<Instant>,
    /// Guards against repeating the "pausing" event within one idle span.
    pause_logged: bool,
}

impl IdleTracker {
    pub fn new(timeout: Option<Duration>, drop_camera_when_idle: bool) -> Self {
        Self {
            timeout,
            drop_camera_when_idle,
            last_sample: None,
            pause_logged: false,
        }
    }

    /// A tracker that never reports idle.
    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True while samples are arriving within the timeout.
    ///
    /// Always true when no timeout is configured, and before the first
    /// sample (no idle span exists yet).
    pub fn is_active(&self, now: Instant) -> bool {
        match (self.timeout, self.last_sample) {
            (None, _) | (_, None) => true,
            (Some(timeout), Some(last)) => now.duration_since(last) <= timeout,
        }
    }

    /// Record an arm sample.
    ///
    /// Returns true when this sample ends a logged idle span; the caller
    /// emits a single "resumed" event.
    pub fn record_sample(&mut self, now: Instant) -> bool {
        let resumed = self.pause_logged;
        self.pause_logged = false;
        self.last_sample = Some(now);
        resumed
    }

    /// Decide whether to drop a camera frame.
    pub fn camera_disposition(&mut self, now: Instant) -> FrameDisposition {
        if self.timeout.is_none() || !self.drop_camera_when_idle || self.is_active(now) {
            return FrameDisposition::Forward;
        }

        let first = !self.pause_logged;
        self.pause_logged = true;
        FrameDisposition::Drop { first_of_span: first }
    }
}
