//! Gateway Assembly
//!
//! [`GatewayBuilder`] turns a [`GatewayConfig`] and a set of raw backends into
//! a ready [`Gateway`]:
//!
//! 1. Each backend is wrapped by [`decorate`] using the configured layers.
//! 2. The raw backend is registered with the [`HealthMonitor`], so probes skip
//!    the cache and the rate limiter.
//! 3. The decorated handle is registered with the [`BackendRouter`].
//!
//! Everything shared (metrics, response cache, health cache) is created here
//! unless the host supplies its own.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adaptive::{AdaptiveLoop, Evaluator, Optimizer};
use crate::backend::SharedBackend;
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::health::{HealthCheckCache, HealthCheckResult, HealthMonitor};
use crate::memory::KeyValueMemory;
use crate::metrics::GatewayMetrics;
use crate::resilience::cache::ResponseCache;
use crate::resilience::rate_limit::RateLimiterState;
use crate::resilience::{decorate, ResilienceLayers};
use crate::router::{BackendRouter, RoutedResponse};

/// Builds a [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    backends: Vec<SharedBackend>,
    metrics: Option<Arc<GatewayMetrics>>,
    health_cache: Option<Arc<HealthCheckCache>>,
}

impl GatewayBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            metrics: None,
            health_cache: None,
        }
    }

    /// Add a raw backend
    #[must_use]
    pub fn backend(mut self, backend: SharedBackend) -> Self {
        self.backends.push(backend);
        self
    }

    /// Add several raw backends
    #[must_use]
    pub fn backends<I>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = SharedBackend>,
    {
        self.backends.extend(backends);
        self
    }

    /// Use an existing metrics registry
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use an existing health result cache
    #[must_use]
    pub fn health_cache(mut self, cache: Arc<HealthCheckCache>) -> Self {
        self.health_cache = Some(cache);
        self
    }

    /// Wire everything together
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::DuplicateBackend` if two backends share a name.
    pub fn build(self) -> GatewayResult<Gateway> {
        let config = self.config;
        let metrics = self.metrics.unwrap_or_default();
        let health_cache = self
            .health_cache
            .unwrap_or_else(|| Arc::new(HealthCheckCache::new(config.health.cache_duration)));
        let health = Arc::new(HealthMonitor::new(config.health.clone(), health_cache));

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(config.cache.clone())));

        let mut layers = ResilienceLayers::new().with_metrics(Arc::clone(&metrics));
        if let Some(cache) = &cache {
            layers = layers.with_cache(Arc::clone(cache));
        }
        if config.rate_limit_enabled {
            layers = layers.with_rate_limit(config.rate_limit.clone());
        }
        if let Some(timeout) = config.backend_timeout {
            layers = layers.with_timeout(timeout);
        }

        let mut router = BackendRouter::new(config.router.clone(), Arc::clone(&health))
            .with_metrics(Arc::clone(&metrics));
        let mut rate_limiters = HashMap::new();

        for backend in self.backends {
            let decorated = decorate(backend, &layers);
            health.register(Arc::clone(&decorated.raw))?;
            router.register(Arc::clone(&decorated.handle))?;
            if let Some(state) = decorated.rate_limiter {
                rate_limiters.insert(decorated.raw.name().to_string(), state);
            }
        }

        tracing::info!(
            backends = router.backend_names().len(),
            cache = cache.is_some(),
            rate_limited = config.rate_limit_enabled,
            source = %config.source(),
            "Gateway assembled"
        );

        Ok(Gateway {
            config,
            router: Arc::new(router),
            health,
            metrics,
            cache,
            rate_limiters,
        })
    }
}

/// Assembled gateway
pub struct Gateway {
    config: GatewayConfig,
    router: Arc<BackendRouter>,
    health: Arc<HealthMonitor>,
    metrics: Arc<GatewayMetrics>,
    cache: Option<Arc<ResponseCache>>,
    rate_limiters: HashMap<String, Arc<RateLimiterState>>,
}

impl Gateway {
    /// Start building
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Configuration used to build this gateway
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The router
    #[must_use]
    pub fn router(&self) -> Arc<BackendRouter> {
        Arc::clone(&self.router)
    }

    /// The health monitor
    #[must_use]
    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    /// The metrics registry
    #[must_use]
    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The response cache, when enabled
    #[must_use]
    pub fn cache(&self) -> Option<Arc<ResponseCache>> {
        self.cache.clone()
    }

    /// Rate-limit state for one backend, when rate limiting is enabled
    #[must_use]
    pub fn rate_limiter(&self, backend: &str) -> Option<Arc<RateLimiterState>> {
        self.rate_limiters.get(backend).cloned()
    }

    /// First successful answer in preference order
    ///
    /// # Errors
    ///
    /// See [`BackendRouter::generate`].
    pub async fn generate(&self, prompt: &str) -> GatewayResult<RoutedResponse> {
        self.router.generate(prompt).await
    }

    /// Highest-scoring answer across available backends
    ///
    /// # Errors
    ///
    /// See [`BackendRouter::generate_best`].
    pub async fn generate_best(&self, prompt: &str) -> GatewayResult<RoutedResponse> {
        self.router.generate_best(prompt).await
    }

    /// Probe every backend (cached for the health window)
    pub async fn check_health(&self) -> HashMap<String, HealthCheckResult> {
        self.health.check_all_providers().await
    }

    /// Prometheus text export of the metrics registry
    #[must_use]
    pub fn metrics_report(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Adaptive loop over this gateway's router
    #[must_use]
    pub fn adaptive_loop(
        &self,
        evaluator: Arc<dyn Evaluator>,
        optimizer: Arc<dyn Optimizer>,
        memory: Arc<dyn KeyValueMemory>,
    ) -> AdaptiveLoop {
        AdaptiveLoop::new(
            Arc::clone(&self.router),
            Arc::clone(&self.health),
            evaluator,
            optimizer,
            memory,
        )
        .with_config(self.config.evaluation.clone())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("backends", &self.router.backend_names())
            .field("cache", &self.cache.is_some())
            .field("rate_limited", &self.rate_limiters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
