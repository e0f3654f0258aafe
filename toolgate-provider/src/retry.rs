//! Retry policy and failure classification.
//!
//! Pure types and functions for deciding whether and when to retry. The
//! retry loop itself lives in the gateway facade; the breaker reuses
//! [`jittered`] for its cool-down.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How a failed remote exchange should be treated.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Transient failure (timeouts, 408, 5xx). Optional delay hint from the
    /// server.
    Retryable { delay_hint: Option<Duration> },
    /// The remote side rate limited us.
    RateLimit { retry_after: Option<Duration> },
    /// The call reached the endpoint and was rejected on its merits.
    Fatal,
    /// Credentials missing or rejected.
    AuthError,
}

impl ErrorClass {
    /// Map an HTTP status from a tool endpoint or backend.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthError,
            429 => Self::RateLimit { retry_after: None },
            408 | 500..=599 => Self::Retryable { delay_hint: None },
            _ => Self::Fatal,
        }
    }

    /// Same as [`ErrorClass::from_status`], carrying a `Retry-After` value
    /// (whole seconds) into the delay of rate-limit and retryable classes.
    pub fn from_status_with_retry_after(status: u16, retry_after: Option<&str>) -> Self {
        let hint = retry_after
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        match Self::from_status(status) {
            Self::RateLimit { .. } => Self::RateLimit { retry_after: hint },
            Self::Retryable { .. } => Self::Retryable { delay_hint: hint },
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with bounded, deterministic jitter.
///
/// The delay for retry `n` (0-indexed) is
/// `min(base_delay_ms * backoff_factor^n, max_delay_ms)`, scaled by a jitter
/// factor in `[1 - jitter_ratio, 1 + jitter_ratio]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt`, or `None` once retries are exhausted. A
    /// server hint wins when it is longer than the computed delay, but never
    /// exceeds `max_delay_ms`.
    pub fn next_delay(&self, attempt: u32, hint: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let exp = self.backoff_factor.max(1.0).powi(attempt.min(32) as i32);
        let raw = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let delay = jittered(
            Duration::from_millis(raw as u64),
            self.jitter_ratio,
            u64::from(attempt),
        );
        let ceiling = Duration::from_millis(self.max_delay_ms);
        Some(match hint {
            Some(hint) if hint > delay => hint.min(ceiling),
            _ => delay,
        })
    }
}

/// Scale `delay` by a factor in `[1 - ratio, 1 + ratio]` chosen from `seed`
/// with the golden-ratio sequence, so spacing is spread without a random
/// source and tests stay deterministic.
pub fn jittered(delay: Duration, ratio: f64, seed: u64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio == 0.0 {
        return delay;
    }
    let frac = (seed as f64 * 0.618_033_988_749) % 1.0;
    let factor = 1.0 - ratio + 2.0 * ratio * frac;
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.001))
}
