//! Error model: the domain error and the structured error shape that crosses
//! component boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, illegal
/// transitions, conflicts). Provider and network failures belong to the layers
/// that perform I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested edge is not part of the lifecycle graph.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Debug, event: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            event: event.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Classify into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) | DomainError::InvalidId(_) | DomainError::NotFound(_) => {
                ErrorKind::Validation
            }
            DomainError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DomainError::Conflict(_) => ErrorKind::ConcurrencyConflict,
        }
    }
}

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller's fault (bad input, unknown id).
    Validation,
    /// The AI provider failed. Retryable unless the provider marked it fatal.
    Provider,
    /// Transport failure.
    Network,
    /// A circuit breaker rejected the call without executing it.
    CircuitOpen,
    /// An attempt ceiling was exhausted.
    Timeout,
    /// A conditional write lost; re-read and retry.
    ConcurrencyConflict,
    /// Programming or data error: the lifecycle graph forbids the edge.
    InvalidTransition,
}

impl ErrorKind {
    /// Whether an automatic retry of the same call may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Provider | ErrorKind::Network | ErrorKind::ConcurrencyConflict
        )
    }

    /// Whether the client should offer a "try again" affordance.
    pub fn is_user_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Provider | ErrorKind::Network | ErrorKind::CircuitOpen | ErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Provider => "provider",
            ErrorKind::Network => "network",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::InvalidTransition => "invalid_transition",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error recorded on jobs and surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Set by providers for failures that must not be retried.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub fatal: bool,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    /// Mark the error as non-retryable regardless of its kind.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn is_retryable(&self) -> bool {
        !self.fatal && self.kind.is_retryable()
    }

    pub fn is_user_retryable(&self) -> bool {
        !self.fatal && self.kind.is_user_retryable()
    }
}

impl From<&DomainError> for JobError {
    fn from(err: &DomainError) -> Self {
        JobError::new(err.kind(), err.to_string())
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        JobError::from(&err)
    }
}
