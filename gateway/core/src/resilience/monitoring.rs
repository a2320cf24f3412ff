//! Monitoring decorator
//!
//! Records latency, outcome and token usage for every call into a shared
//! [`GatewayMetrics`] registry. Errors pass through unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::backend::{Generation, LlmBackend, SharedBackend};
use crate::error::BackendError;
use crate::metrics::GatewayMetrics;

/// Observes every call to the wrapped backend
pub struct MonitoredBackend {
    inner: SharedBackend,
    metrics: Arc<GatewayMetrics>,
}

impl MonitoredBackend {
    /// Wrap a backend
    pub fn new(inner: SharedBackend, metrics: Arc<GatewayMetrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl LlmBackend for MonitoredBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError> {
        let name = self.inner.name();
        self.metrics.record_request_start(name);
        let started = Instant::now();

        let result = self.inner.generate(prompt).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(generation) => {
                self.metrics
                    .record_success(name, elapsed, generation.token_usage);
                tracing::debug!(
                    backend = %name,
                    elapsed_ms = elapsed.as_millis(),
                    cached = generation.cached,
                    "Backend call succeeded"
                );
            }
            Err(error) => {
                self.metrics.record_failure(name, elapsed, error);
                tracing::warn!(
                    backend = %name,
                    elapsed_ms = elapsed.as_millis(),
                    kind = error.kind(),
                    error = %error,
                    "Backend call failed"
                );
            }
        }
        result
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }
}
