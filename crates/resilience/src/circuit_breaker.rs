//! Circuit breaker keyed on consecutive failures.
//!
//! State transitions:
//! - Closed → Open: when consecutive failures reach `failure_threshold`
//! - Open → HalfOpen: on the first call after `cool_down` has elapsed
//! - HalfOpen → Closed: when the single probe call succeeds
//! - HalfOpen → Open: when the probe fails (cool-down restarts)
//!
//! While half-open exactly one probe is in flight; every other call is
//! rejected as if the breaker were open.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pixelflow_core::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Requests fail fast
    Open,
    /// Cool-down elapsed, one probe request allowed
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count that opens the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

/// Rejection returned while the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{0}' is open - failing fast")]
pub struct CircuitOpen(pub String);

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    #[error("call failed: {0}")]
    Failed(E),
}

#[derive(Debug)]
struct BreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// One breaker per external dependency. Cloning shares state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn TimeSource>,
    state: Arc<Mutex<BreakerState>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            config,
            clock,
            state: Arc::new(Mutex::new(BreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (for monitoring). Does not advance Open → HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.state.lock().current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Ask to make a call. The returned permit must be settled with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping it
    /// unsettled releases a probe slot without changing state.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut state = self.state.lock();

        match state.current {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let cooled = state.opened_at.is_none_or(|opened_at| {
                    let elapsed = self.clock.now() - opened_at;
                    elapsed >= chrono::Duration::from_std(self.config.cool_down).unwrap_or_default()
                });
                if cooled {
                    info!(breaker = %self.name, "circuit breaker: Open → HalfOpen");
                    state.current = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(CircuitOpen(self.name.to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(CircuitOpen(self.name.to_string()))
                } else {
                    state.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    /// Execute a future with circuit breaker protection. Every `Err` counts
    /// as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitBreakerError::Failed(e))
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock();
        match state.current {
            CircuitState::HalfOpen if probe => {
                info!(breaker = %self.name, "circuit breaker: HalfOpen → Closed");
                state.current = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                state.probe_in_flight = false;
            }
            CircuitState::Closed => state.consecutive_failures = 0,
            // A call admitted before the circuit opened; its result is stale.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        match state.current {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "circuit breaker: Closed → Open"
                    );
                    state.current = CircuitState::Open;
                    state.opened_at = Some(self.clock.now());
                }
            }
            CircuitState::HalfOpen if probe => {
                warn!(breaker = %self.name, "circuit breaker: HalfOpen → Open (probe failed)");
                state.current = CircuitState::Open;
                state.opened_at = Some(self.clock.now());
                state.probe_in_flight = false;
            }
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn release_probe(&self) {
        self.state.lock().probe_in_flight = false;
    }
}

/// Admission to call the protected dependency.
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}
