//! Per-endpoint health state machine.
//!
//! ```text
//! unknown -> healthy <-> degraded -> circuit_open -> half_open -> healthy | circuit_open
//! ```
//!
//! The breaker is a plain value: callers pass the current instant in and
//! hold it behind whatever lock guards the endpoint record.

use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::retry::jittered;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Unknown,
    Healthy,
    Degraded,
    CircuitOpen,
    HalfOpen,
}

impl EndpointState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::CircuitOpen => "circuit_open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Whether the endpoint is expected to answer right now.
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that mark a healthy endpoint degraded.
    pub degrade_after: u32,
    /// Consecutive failures that open the circuit.
    pub open_after: u32,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub base_cooldown: Duration,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub max_cooldown: Duration,
    /// Cool-downs are spread by up to this fraction in either direction.
    pub jitter_ratio: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            degrade_after: 1,
            open_after: 3,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            jitter_ratio: 0.1,
        }
    }
}

/// What the breaker says about an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial. Its outcome decides the next state.
    Trial,
    Refused { retry_after: Duration },
}

/// A state change, reported so the owner can audit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: EndpointState,
    pub to: EndpointState,
}

#[derive(Debug, Clone)]
pub struct Breaker {
    config: BreakerConfig,
    state: EndpointState,
    consecutive_failures: u32,
    /// Cool-down to apply the next time the circuit opens.
    next_cooldown: Duration,
    open_until: Option<Instant>,
    times_opened: u64,
    trial_in_flight: bool,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        let next_cooldown = config.base_cooldown;
        Self {
            config,
            state: EndpointState::Unknown,
            consecutive_failures: 0,
            next_cooldown,
            open_until: None,
            times_opened: 0,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time left before an open circuit admits its trial.
    pub fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.open_until) {
            (EndpointState::CircuitOpen, Some(until)) => Some(until.saturating_duration_since(now)),
            _ => None,
        }
    }

    /// Decide whether a call may go out at `now`. An expired cool-down moves
    /// the breaker to half-open and hands out exactly one trial.
    pub fn admit(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        match self.state {
            EndpointState::CircuitOpen => {
                let until = self.open_until.unwrap_or(now);
                if now < until {
                    return (
                        Admission::Refused {
                            retry_after: until - now,
                        },
                        None,
                    );
                }
                let transition = self.move_to(EndpointState::HalfOpen);
                self.trial_in_flight = true;
                (Admission::Trial, transition)
            }
            EndpointState::HalfOpen if self.trial_in_flight => (
                Admission::Refused {
                    retry_after: Duration::ZERO,
                },
                None,
            ),
            EndpointState::HalfOpen => {
                self.trial_in_flight = true;
                (Admission::Trial, None)
            }
            _ => (Admission::Allowed, None),
        }
    }

    /// Give back an unused trial (the call never went out).
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn record_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        if self.state == EndpointState::HalfOpen {
            self.next_cooldown = self.config.base_cooldown;
        }
        self.open_until = None;
        self.move_to(EndpointState::Healthy)
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            // Late outcomes of calls admitted before the circuit opened.
            EndpointState::CircuitOpen => None,
            EndpointState::HalfOpen => {
                self.trial_in_flight = false;
                self.next_cooldown = self
                    .next_cooldown
                    .saturating_mul(2)
                    .min(self.config.max_cooldown);
                self.open(now)
            }
            EndpointState::Unknown | EndpointState::Healthy | EndpointState::Degraded => {
                if self.consecutive_failures >= self.config.open_after.max(1) {
                    self.open(now)
                } else if self.consecutive_failures >= self.config.degrade_after.max(1) {
                    self.move_to(EndpointState::Degraded)
                } else {
                    None
                }
            }
        }
    }

    fn open(&mut self, now: Instant) -> Option<Transition> {
        self.times_opened += 1;
        let cooldown = jittered(self.next_cooldown, self.config.jitter_ratio, self.times_opened);
        self.open_until = Some(now + cooldown);
        self.move_to(EndpointState::CircuitOpen)
    }

    fn move_to(&mut self, to: EndpointState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(Transition { from, to })
    }
}
