//! Error Taxonomy
//!
//! Two layers of errors flow through the gateway:
//!
//! - [`BackendError`]: a single call to a single backend failed. Decorators and
//!   adapters return it; the router turns it into a routing decision.
//! - [`GatewayError`]: a whole request failed after every alternative was
//!   exhausted. This is what callers of the router and adaptive loop see.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Backend Errors
// ============================================================================

/// Failure of one call against one backend
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Could not reach the backend
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Backend accepted the request but reported a failure
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Backend answered with something that could not be interpreted
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Credentials were rejected
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Call exceeded its deadline
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Admission denied by the rate limiter
    #[error("rate limit exceeded for {backend}, retry after {}ms", .retry_after.as_millis())]
    RateLimitExceeded {
        /// Backend whose window is full
        backend: String,
        /// Time until the oldest request leaves the window
        retry_after: Duration,
    },

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Stable label used to tag error counters
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::RequestFailed(_) => "request_failed",
            Self::MalformedResponse(_) => "malformed_response",
            Self::AuthenticationFailed => "authentication_failed",
            Self::Timeout(_) => "timeout",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this is a rate-limiter denial
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Suggested wait before retrying, if the error carries one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

// ============================================================================
// Attributed Failures
// ============================================================================

/// A backend error attributed to the backend that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendFailure {
    /// Backend name
    pub backend: String,
    /// What went wrong
    pub error: BackendError,
}

impl BackendFailure {
    /// Attribute an error to a backend
    pub fn new(backend: impl Into<String>, error: BackendError) -> Self {
        Self {
            backend: backend.into(),
            error,
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)
    }
}

fn summarize_failures(failures: &[BackendFailure]) -> String {
    if failures.is_empty() {
        return "no backend was available".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Gateway Errors
// ============================================================================

/// Request-level failures surfaced to callers
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GatewayError {
    /// Every attempted backend failed, or none could be attempted
    #[error("all backends failed ({} attempted): {}", .failures.len(), summarize_failures(.failures))]
    AllBackendsFailed {
        /// Every attempted backend with its error, in attempt order
        failures: Vec<BackendFailure>,
    },

    /// Health monitor reports no usable backend
    #[error("no healthy backends available")]
    NoHealthyBackends,

    /// Prompt optimizer failed and no fallback could be used
    #[error("prompt optimization failed: {0}")]
    OptimizationFailed(String),

    /// Evaluation failed or rejected the answer after retries
    #[error("evaluation failed: {reason}")]
    EvaluationFailed {
        /// Backend that produced the rejected answer, if any
        backend: Option<String>,
        /// Evaluator feedback or failure cause
        reason: String,
    },

    /// Backend name is not registered
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Two backends were registered under the same name
    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),
}

impl GatewayError {
    /// Attributed failures when this is an aggregate error
    #[must_use]
    pub fn failures(&self) -> &[BackendFailure] {
        match self {
            Self::AllBackendsFailed { failures } => failures,
            _ => &[],
        }
    }
}

/// Result alias for request-level operations
pub type GatewayResult<T> = Result<T, GatewayError>;
