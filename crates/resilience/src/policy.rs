//! Composed policy: circuit breaker around a retrying call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pixelflow_core::{ErrorKind, JobError, TimeSource};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::retry::{JitterSource, RandomJitter, RetryPolicy};
use crate::sleep::{Sleeper, TokioSleeper};

/// Retry and breaker settings for one dependency.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ResilienceConfig {
    /// AI provider calls: slow and expensive, a few patient retries.
    pub fn ai_provider() -> Self {
        Self {
            retry: RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(8)),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                cool_down: Duration::from_secs(60),
            },
        }
    }

    /// Presign and upload requests from the client.
    pub fn upload() -> Self {
        Self {
            retry: RetryPolicy::exponential(4, Duration::from_millis(250), Duration::from_secs(5)),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 8,
                cool_down: Duration::from_secs(15),
            },
        }
    }

    /// Cheap, idempotent status reads.
    pub fn status_fetch() -> Self {
        Self {
            retry: RetryPolicy::exponential(2, Duration::from_millis(200), Duration::from_secs(1)),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                cool_down: Duration::from_secs(10),
            },
        }
    }
}

/// Per-invocation retry state. Owned by one `execute` call and dropped with it.
#[derive(Debug)]
pub struct ExecutionContext<E> {
    /// Attempts started so far (1-indexed once the first attempt runs).
    pub attempt: u32,
    pub last_error: Option<E>,
    /// Delay computed before the next attempt, if one is scheduled.
    pub next_delay: Option<Duration>,
}

impl<E> Default for ExecutionContext<E> {
    fn default() -> Self {
        Self {
            attempt: 0,
            last_error: None,
            next_delay: None,
        }
    }
}

/// Successful outcome with the attempt count that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Executed<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call; the operation never ran.
    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen { dependency: String },
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },
    /// The operation failed with an error the caller classified as terminal.
    #[error("failed without retry after {attempts} attempts: {error}")]
    Rejected { attempts: u32, error: E },
}

impl<E> ResilienceError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::CircuitOpen { .. } => 0,
            ResilienceError::Exhausted { attempts, .. } | ResilienceError::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn into_error(self) -> Option<E> {
        match self {
            ResilienceError::CircuitOpen { .. } => None,
            ResilienceError::Exhausted { error, .. } | ResilienceError::Rejected { error, .. } => {
                Some(error)
            }
        }
    }
}

impl ResilienceError<JobError> {
    /// Structured form. Exhausted retryable errors keep their own kind.
    pub fn to_job_error(&self) -> JobError {
        match self {
            ResilienceError::CircuitOpen { dependency } => {
                JobError::circuit_open(format!("{dependency} is unavailable"))
            }
            ResilienceError::Exhausted { error, .. } | ResilienceError::Rejected { error, .. } => {
                error.clone()
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::Exhausted { error, .. } | ResilienceError::Rejected { error, .. } => {
                error.kind
            }
        }
    }
}

/// Retry wrapped in a circuit breaker, for a single external dependency.
///
/// Only errors the caller classifies as retryable count against the breaker:
/// a terminal error (bad request, content rejected) means the dependency
/// answered, so it settles the breaker permit as healthy.
#[derive(Clone)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
}

impl std::fmt::Debug for ResiliencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePolicy")
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl ResiliencePolicy {
    pub fn new(dependency: impl Into<String>, config: ResilienceConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            breaker: CircuitBreaker::new(dependency, config.circuit_breaker, clock),
            retry: config.retry,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn dependency(&self) -> &str {
        self.breaker.name()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op` under the policy.
    ///
    /// `is_retryable` decides, per error, whether another attempt may help.
    /// An open breaker fails fast before any attempt is consumed.
    pub async fn execute<T, E, F, Fut, R>(&self, is_retryable: R, mut op: F) -> Result<Executed<T>, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                debug!(dependency = %open.0, "call rejected by open circuit");
                return Err(ResilienceError::CircuitOpen { dependency: open.0 });
            }
        };

        let mut ctx = ExecutionContext::<E>::default();
        loop {
            ctx.attempt += 1;
            match op().await {
                Ok(value) => {
                    permit.success();
                    return Ok(Executed {
                        value,
                        attempts: ctx.attempt,
                    });
                }
                Err(err) if !is_retryable(&err) => {
                    debug!(dependency = %self.dependency(), attempt = ctx.attempt, error = %err, "terminal error");
                    permit.success();
                    return Err(ResilienceError::Rejected {
                        attempts: ctx.attempt,
                        error: err,
                    });
                }
                Err(err) => {
                    if !self.retry.should_retry(ctx.attempt) {
                        warn!(
                            dependency = %self.dependency(),
                            attempts = ctx.attempt,
                            error = %err,
                            "retries exhausted"
                        );
                        permit.failure();
                        return Err(ResilienceError::Exhausted {
                            attempts: ctx.attempt,
                            error: err,
                        });
                    }

                    let delay = self.retry.delay_for(ctx.attempt, self.jitter.sample());
                    warn!(
                        dependency = %self.dependency(),
                        attempt = ctx.attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    ctx.last_error = Some(err);
                    ctx.next_delay = Some(delay);
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }

    /// [`execute`](Self::execute) for operations failing with [`JobError`],
    /// classified by the error's own retryability.
    pub async fn execute_job<T, F, Fut>(&self, op: F) -> Result<Executed<T>, ResilienceError<JobError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        self.execute(JobError::is_retryable, op).await
    }
}
