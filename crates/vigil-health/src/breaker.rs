//! Per-check circuit breaker.
//!
//! Counts consecutive failures and, once the threshold is reached, stops
//! calls to the probe for `timeout`. The first call after the timeout runs
//! in the half-open state and decides whether the breaker closes again.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_core::duration::MAX_DURATION;
use vigil_core::epoch_secs;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls go through.
    Closed,
    /// Calls are rejected until the retry time.
    Open,
    /// One trial call is in progress.
    HalfOpen,
}

/// Failure-isolation state machine for one check.
///
/// `next_attempt` is `Some` exactly when the state is `Open`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    timeout: Duration,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    next_attempt: Option<Instant>,
    /// Wall-clock copies of the above, for display.
    last_failure_epoch: Option<u64>,
    last_success_epoch: Option<u64>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// A threshold of zero is treated as one.
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            timeout,
            last_failure: None,
            last_success: None,
            next_attempt: None,
            last_failure_epoch: None,
            last_success_epoch: None,
        }
    }

    pub fn is_call_allowed(&mut self) -> bool {
        self.is_call_allowed_at(Instant::now())
    }

    /// Whether a call may proceed at `now`.
    ///
    /// An open breaker whose retry time has passed moves to half-open and
    /// lets this call through. Every other call is rejected until that trial
    /// call is recorded.
    pub fn is_call_allowed_at(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => match self.next_attempt {
                Some(at) if now >= at => {
                    self.state = BreakerState::HalfOpen;
                    self.next_attempt = None;
                    debug!(
                        failures = self.consecutive_failures,
                        "breaker half-open, allowing trial call"
                    );
                    true
                }
                _ => false,
            },
        }
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Instant::now());
    }

    /// Record a passing call: resets the failure count and closes the breaker.
    pub fn record_success_at(&mut self, now: Instant) {
        if self.state != BreakerState::Closed {
            info!(
                previous = ?self.state,
                "breaker closed after successful call"
            );
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.next_attempt = None;
        self.last_success = Some(now);
        self.last_success_epoch = Some(epoch_secs());
    }

    pub fn record_failure(&mut self) -> bool {
        self.record_failure_at(Instant::now())
    }

    /// Record a failing call. Returns `true` if this failure opened the breaker.
    pub fn record_failure_at(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.last_failure_epoch = Some(epoch_secs());

        match self.state {
            BreakerState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.trip(now);
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.failure_threshold,
                    timeout_secs = self.timeout.as_secs(),
                    "breaker opened"
                );
                true
            }
            BreakerState::HalfOpen => {
                self.trip(now);
                warn!(
                    failures = self.consecutive_failures,
                    "trial call failed, breaker re-opened"
                );
                true
            }
            // A late failure while open keeps the current retry time.
            _ => false,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.next_attempt = Some(now + self.timeout.min(MAX_DURATION));
        self.state = BreakerState::Open;
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Time left until an open breaker allows a trial call.
    pub fn retry_in_at(&self, now: Instant) -> Option<Duration> {
        self.next_attempt.map(|at| at.saturating_duration_since(now))
    }

    /// Serializable view of the breaker at `now`.
    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.failure_threshold,
            timeout_ms: self.timeout.as_millis() as u64,
            last_failure_at: self.last_failure_epoch,
            last_success_at: self.last_success_epoch,
            retry_in_ms: self.retry_in_at(now).map(|d| d.as_millis() as u64),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Instant::now())
    }
}

/// Point-in-time breaker view exposed by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    /// Unix timestamp of the last failure.
    pub last_failure_at: Option<u64>,
    /// Unix timestamp of the last success.
    pub last_success_at: Option<u64>,
    /// Milliseconds until a trial call is allowed (open only).
    pub retry_in_ms: Option<u64>,
}
