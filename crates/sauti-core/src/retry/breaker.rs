//! Circuit breaker guarding calls to a failing downstream.
//!
//! One instance per guarded target, constructor-injected into the
//! executor that owns it. After `threshold` consecutive failures the
//! breaker opens; once the cooldown elapses it moves to half-open and
//! admits exactly one in-flight probe. Concurrent callers arriving while
//! the probe is outstanding are rejected, so a retry storm cannot slip
//! through the half-open window.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker state as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed, call proceeds normally.
    Admitted,
    /// Cooldown elapsed; this call is the single half-open probe.
    Probe,
    /// Breaker is open (or a probe is already in flight).
    Rejected {
        /// Time remaining until the next probe may be admitted.
        retry_after: Duration,
    },
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
    trips: u64,
}

/// Fault-isolation state machine for one downstream target.
pub struct CircuitBreaker {
    target: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub const DEFAULT_THRESHOLD: u32 = 5;
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

    /// Create a breaker with the default threshold (5) and cooldown (60s).
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_settings(target, Self::DEFAULT_THRESHOLD, Self::DEFAULT_COOLDOWN)
    }

    pub fn with_settings(target: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            target: target.into(),
            threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                next_attempt: None,
                probe_in_flight: false,
                trips: 0,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Ask the breaker whether a call may proceed.
    pub fn acquire(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => Admission::Admitted,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected {
                        retry_after: self.cooldown,
                    }
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
            BreakerState::Open => {
                let next = inner.next_attempt.unwrap_or(now);
                if now >= next {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!(target = %self.target, "circuit breaker half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: next - now,
                    }
                }
            }
        }
    }

    /// Record a successful call. A successful probe closes the breaker and
    /// resets the failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.success_count += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                debug!(target = %self.target, "probe succeeded, closing circuit breaker");
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.probe_in_flight = false;
                inner.next_attempt = None;
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call. At `threshold` consecutive failures the
    /// breaker opens; a failed probe re-opens it immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        inner.last_failure = Some(now);

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.next_attempt = Some(now + self.cooldown);
                    inner.trips += 1;
                    warn!(
                        target = %self.target,
                        failures = inner.failure_count,
                        cooldown_secs = self.cooldown.as_secs(),
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.failure_count += 1;
                inner.state = BreakerState::Open;
                inner.next_attempt = Some(now + self.cooldown);
                inner.probe_in_flight = false;
                inner.trips += 1;
                warn!(target = %self.target, "probe failed, circuit breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failure_count
    }

    /// Number of times the breaker has tripped open.
    pub fn trips(&self) -> u64 {
        self.inner.lock().expect("breaker lock poisoned").trips
    }
}
