//! `pixelflow-resilience`: Retry and circuit breaking for remote calls.
//!
//! - **Retry**: bounded attempts, exponential backoff with jitter, capped delay
//! - **Circuit breaker**: opens after consecutive failures, half-opens after a
//!   cool-down to admit a single probe
//! - **Policy**: the breaker wrapped around the retrying call, one instance per
//!   external dependency
//!
//! Time, randomness and sleeping are injected so every schedule can be
//! replayed in tests.

pub mod circuit_breaker;
pub mod policy;
pub mod retry;
pub mod sleep;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitOpen,
    CircuitState,
};
pub use policy::{ExecutionContext, Executed, ResilienceConfig, ResilienceError, ResiliencePolicy};
pub use retry::{BackoffStrategy, FixedJitter, JitterSource, RandomJitter, RetryPolicy};
pub use sleep::{NoopSleeper, RecordingSleeper, Sleeper, TokioSleeper};
