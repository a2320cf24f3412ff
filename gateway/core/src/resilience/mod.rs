//! Resilience Decorators
//!
//! Each decorator implements [`LlmBackend`](crate::backend::LlmBackend),
//! adds one concern, and forwards to the backend it wraps. They compose by
//! nesting, outermost first:
//!
//! ```text
//! Monitoring -> Caching -> RateLimiting -> Timeout -> raw backend
//! ```
//!
//! A cache hit therefore never consumes rate-limit capacity, and monitoring
//! sees every call including cache hits and rate-limit denials.
//!
//! [`decorate`] builds this chain from a [`ResilienceLayers`] description.
//! Layers left as `None` are skipped.

pub mod cache;
pub mod monitoring;
pub mod rate_limit;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use crate::backend::SharedBackend;
use crate::metrics::GatewayMetrics;

use cache::{CachingBackend, ResponseCache};
use monitoring::MonitoredBackend;
use rate_limit::{RateLimitConfig, RateLimitedBackend, RateLimiterState};
use timeout::TimeoutBackend;

/// Which decorators to apply around a backend
#[derive(Clone, Default)]
pub struct ResilienceLayers {
    /// Metrics registry for the monitoring layer
    pub metrics: Option<Arc<GatewayMetrics>>,
    /// Shared response cache
    pub cache: Option<Arc<ResponseCache>>,
    /// Per-backend rate limiting (fresh state per backend)
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-call deadline
    pub timeout: Option<Duration>,
}

impl ResilienceLayers {
    /// No layers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add monitoring
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add caching
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add rate limiting
    #[must_use]
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Add a call deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A backend wrapped in its decorator chain
#[derive(Clone)]
pub struct DecoratedBackend {
    /// Outermost layer; use this for routing
    pub handle: SharedBackend,
    /// The undecorated backend; use this for health probes
    pub raw: SharedBackend,
    /// Limiter state, when rate limiting is applied
    pub rate_limiter: Option<Arc<RateLimiterState>>,
}

impl DecoratedBackend {
    /// Backend name
    #[must_use]
    pub fn name(&self) -> &str {
        self.raw.name()
    }
}

/// Wrap a backend in the requested layers
#[must_use]
pub fn decorate(backend: SharedBackend, layers: &ResilienceLayers) -> DecoratedBackend {
    let raw = Arc::clone(&backend);
    let mut handle = backend;

    if let Some(timeout) = layers.timeout {
        handle = Arc::new(TimeoutBackend::new(handle, timeout));
    }

    let mut rate_limiter = None;
    if let Some(config) = &layers.rate_limit {
        let state = Arc::new(RateLimiterState::new(raw.name(), config.clone()));
        let mut limited = RateLimitedBackend::with_state(handle, Arc::clone(&state));
        if let Some(metrics) = &layers.metrics {
            limited = limited.with_metrics(Arc::clone(metrics));
        }
        rate_limiter = Some(state);
        handle = Arc::new(limited);
    }

    if let Some(cache) = &layers.cache {
        let mut cached = CachingBackend::new(handle, Arc::clone(cache));
        if let Some(metrics) = &layers.metrics {
            cached = cached.with_metrics(Arc::clone(metrics));
        }
        handle = Arc::new(cached);
    }

    if let Some(metrics) = &layers.metrics {
        handle = Arc::new(MonitoredBackend::new(handle, Arc::clone(metrics)));
    }

    tracing::debug!(
        backend = %raw.name(),
        monitored = layers.metrics.is_some(),
        cached = layers.cache.is_some(),
        rate_limited = layers.rate_limit.is_some(),
        timeout_ms = layers.timeout.map(|t| t.as_millis()),
        "Decorated backend"
    );

    DecoratedBackend {
        handle,
        raw,
        rate_limiter,
    }
}
