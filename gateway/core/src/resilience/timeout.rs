//! Timeout decorator
//!
//! Bounds each call to the wrapped backend. Expiry becomes
//! [`BackendError::Timeout`], which the router treats like any other failure.

use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Generation, LlmBackend, SharedBackend};
use crate::error::BackendError;

/// Deadline for every `generate` call
pub struct TimeoutBackend {
    inner: SharedBackend,
    timeout: Duration,
}

impl TimeoutBackend {
    /// Wrap a backend with a per-call deadline
    pub fn new(inner: SharedBackend, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The configured deadline
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LlmBackend for TimeoutBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError> {
        if let Ok(result) = tokio::time::timeout(self.timeout, self.inner.generate(prompt)).await {
            result
        } else {
            tracing::warn!(
                backend = %self.name(),
                timeout_ms = self.timeout.as_millis(),
                "Backend call timed out"
            );
            Err(BackendError::Timeout(self.timeout))
        }
    }

    async fn is_healthy(&self) -> bool {
        tokio::time::timeout(self.timeout, self.inner.is_healthy())
            .await
            .unwrap_or(false)
    }
}
