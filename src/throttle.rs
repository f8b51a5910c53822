//! Sliding-window admission control

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Bounds how many updates may enter the pipeline per window
///
/// Keeps the timestamps of recently admitted updates; an update is admitted
/// only while fewer than `max_per_window` of them fall inside the trailing
/// window.
#[derive(Debug)]
pub struct ThrottleGate {
    admitted: VecDeque<Instant>,
    max_per_window: usize,
    window: Duration,
}

impl ThrottleGate {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            admitted: VecDeque::with_capacity(max_per_window),
            max_per_window,
            window,
        }
    }

    /// Admits an update at `now` if the window has room
    pub fn admit(&mut self, now: Instant) -> bool {
        self.purge(now);

        if self.admitted.len() < self.max_per_window {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Records an update that bypassed admission
    ///
    /// Forced updates still occupy a slot so later admissions see the real
    /// load.
    pub fn record_forced(&mut self, now: Instant) {
        self.purge(now);
        self.admitted.push_back(now);
    }

    /// Drops timestamps that fell out of the window
    pub fn purge(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admissions currently counted in the window
    pub fn in_window(&self) -> usize {
        self.admitted.len()
    }
}
