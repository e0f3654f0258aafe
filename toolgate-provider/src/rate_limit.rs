//! Sliding-window invocation counter for one endpoint.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: VecDeque::new(),
        }
    }

    /// Record one invocation at `now` if fewer than `limit` happened in the
    /// trailing window. On refusal returns how long until the oldest hit
    /// leaves the window. `None` means unlimited.
    pub fn try_acquire(&mut self, now: Instant, limit: Option<u32>) -> Result<(), Duration> {
        self.evict(now);
        let Some(limit) = limit else {
            self.hits.push_back(now);
            return Ok(());
        };
        if self.hits.len() >= limit as usize {
            let oldest = self.hits.front().copied().unwrap_or(now);
            return Err((oldest + self.window).saturating_duration_since(now));
        }
        self.hits.push_back(now);
        Ok(())
    }

    /// Invocations inside the window ending at `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.hits.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}
