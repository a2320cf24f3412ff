//! Multi-Backend Router
//!
//! The main entry point for sending a prompt to one or more backends.
//! Coordinates preference ordering, temporary disabling of failed backends,
//! health gating and response selection.
//!
//! # Selection
//!
//! ```text
//! registered backends
//!         |  preference: drop disallowed, sort by weight (ties: registration order)
//!         v
//! ordered candidates
//!         |  gates: route options -> not disabled -> live is_healthy()
//!         v
//! generate:           first success wins, later backends untouched
//! generate_from_all:  every candidate, concurrently, successes in order
//! generate_best:      generate_from_all, highest score wins (ties: first seen)
//! ```
//!
//! A backend whose `generate` fails is disabled for the configured window
//! (5 minutes by default) and gets a failure recorded with the
//! [`HealthMonitor`]. It becomes eligible again on its own once the window
//! passes.
//!
//! # Usage
//!
//! ```ignore
//! let mut router = BackendRouter::new(RouterConfig::default(), health);
//! router.register(openai)?;
//! router.register(local)?;
//!
//! let routed = router.generate("Summarize this").await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::backend::{Generation, SharedBackend};
use crate::error::{BackendError, BackendFailure, GatewayError, GatewayResult};
use crate::health::HealthMonitor;
use crate::metrics::GatewayMetrics;
use crate::scorer::score_response;

/// Default temporary-disable window after a failure
pub const DEFAULT_DISABLE_WINDOW: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Preference
// ============================================================================

/// Ordered, optionally weighted, set of backends a caller prefers
///
/// - Listed names get weight `1.0, 0.8, 0.64, ...` by position.
/// - Explicit weights override the positional weight and also allow a name.
/// - With nothing listed, every backend is allowed with weight 0.
/// - With names listed, unlisted backends are disallowed unless `allow_all`
///   is set, in which case they get weight 0.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preference {
    ordered: Vec<String>,
    weights: HashMap<String, f64>,
    allow_all: bool,
}

impl Preference {
    /// Weight ratio between consecutive listed backends
    pub const DECAY: f64 = 0.8;

    /// Allow every backend equally
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Prefer backends in the given order
    pub fn ordered<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ordered: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Override one backend's weight
    #[must_use]
    pub fn with_weight(mut self, name: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(name.into(), weight);
        self
    }

    /// Allow unlisted backends at weight 0
    #[must_use]
    pub fn with_allow_all(mut self, allow_all: bool) -> Self {
        self.allow_all = allow_all;
        self
    }

    /// Listed names in order
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.ordered
    }

    /// Whether this preference restricts nothing
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.allow_all || (self.ordered.is_empty() && self.weights.is_empty())
    }

    /// Weight for a backend, or `None` if it is disallowed
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn weight(&self, name: &str) -> Option<f64> {
        if let Some(weight) = self.weights.get(name) {
            return Some(*weight);
        }
        if let Some(position) = self.ordered.iter().position(|n| n == name) {
            return Some(Self::DECAY.powi(position as i32));
        }
        self.is_unrestricted().then_some(0.0)
    }

    /// Whether a backend may be used at all
    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        self.weight(name).is_some()
    }
}

// ============================================================================
// Router Configuration
// ============================================================================

/// Router configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RouterConfig {
    /// How long a failed backend stays out of rotation
    pub disable_window: Duration,

    /// Initial preference
    pub preference: Preference,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            disable_window: DEFAULT_DISABLE_WINDOW,
            preference: Preference::any(),
        }
    }
}

impl RouterConfig {
    /// Set the disable window
    #[must_use]
    pub fn with_disable_window(mut self, window: Duration) -> Self {
        self.disable_window = window;
        self
    }

    /// Set the initial preference
    #[must_use]
    pub fn with_preference(mut self, preference: Preference) -> Self {
        self.preference = preference;
        self
    }
}

// ============================================================================
// Route Options / Responses
// ============================================================================

/// Per-call routing restrictions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteOptions {
    allowed: Option<HashSet<String>>,
}

impl RouteOptions {
    /// No restriction beyond the router's preference
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Only consider these backends
    pub fn restricted_to<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether a backend passes this restriction
    #[must_use]
    pub fn permits(&self, name: &str) -> bool {
        self.allowed.as_ref().map_or(true, |set| set.contains(name))
    }
}

/// A response together with the backend that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedResponse {
    /// Backend that answered
    pub backend: String,
    /// The answer
    pub generation: Generation,
    /// Quality score, when the response was selected by scoring
    pub score: Option<f64>,
}

// ============================================================================
// Backend Router
// ============================================================================

/// Routes prompts across registered backends
pub struct BackendRouter {
    config: RouterConfig,
    /// Registration order
    backends: Vec<SharedBackend>,
    preference: RwLock<Preference>,
    /// Most recent failure per backend
    disabled: DashMap<String, Instant>,
    health: Arc<HealthMonitor>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl BackendRouter {
    /// Create a router reporting failures to `health`
    #[must_use]
    pub fn new(config: RouterConfig, health: Arc<HealthMonitor>) -> Self {
        let preference = RwLock::new(config.preference.clone());
        Self {
            config,
            backends: Vec::new(),
            preference,
            disabled: DashMap::new(),
            health,
            metrics: None,
        }
    }

    /// Report fallbacks and routed requests to a metrics registry
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a (usually decorated) backend
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::DuplicateBackend` if the name is taken.
    pub fn register(&mut self, backend: SharedBackend) -> GatewayResult<()> {
        if self.backends.iter().any(|b| b.name() == backend.name()) {
            return Err(GatewayError::DuplicateBackend(backend.name().to_string()));
        }
        tracing::info!(backend = %backend.name(), "Registered backend");
        self.backends.push(backend);
        Ok(())
    }

    /// Registered names in registration order
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Health monitor receiving failure reports
    #[must_use]
    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    /// Current preference
    #[must_use]
    pub fn preference(&self) -> Preference {
        self.preference.read().clone()
    }

    /// Replace the preference at runtime
    pub fn set_preference(&self, preference: Preference) {
        tracing::info!(preferred = ?preference.names(), "Updated backend preference");
        *self.preference.write() = preference;
    }

    fn ordered_backends(&self) -> Vec<SharedBackend> {
        let preference = self.preference.read();
        let mut weighted: Vec<(f64, &SharedBackend)> = self
            .backends
            .iter()
            .filter_map(|b| preference.weight(b.name()).map(|w| (w, b)))
            .collect();
        // sort_by is stable, so equal weights keep registration order
        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
        weighted.into_iter().map(|(_, b)| Arc::clone(b)).collect()
    }

    /// Allowed backend names, highest weight first
    #[must_use]
    pub fn order_by_preference(&self) -> Vec<String> {
        self.ordered_backends()
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    /// Time left in a backend's disable window, clearing it once expired
    #[must_use]
    pub fn disabled_remaining(&self, backend: &str) -> Option<Duration> {
        let failed_at = self.disabled.get(backend).map(|entry| *entry.value())?;
        let elapsed = failed_at.elapsed();
        if elapsed < self.config.disable_window {
            return Some(self.config.disable_window - elapsed);
        }
        self.disabled
            .remove_if(backend, |_, at| at.elapsed() >= self.config.disable_window);
        None
    }

    /// Preference-allowed and outside the disable window
    #[must_use]
    pub fn is_available(&self, backend: &str) -> bool {
        self.preference.read().allows(backend) && self.disabled_remaining(backend).is_none()
    }

    /// Disable a backend now and report the failure to the health monitor
    pub fn mark_failed(&self, backend: &str, error: &BackendError) {
        self.disabled.insert(backend.to_string(), Instant::now());
        let failures = self.health.record_failure(backend);
        tracing::warn!(
            backend = %backend,
            kind = error.kind(),
            error = %error,
            in_window_failures = failures,
            disabled_for_secs = self.config.disable_window.as_secs(),
            "Backend failed, temporarily disabled"
        );
    }

    /// Lift a backend's disable window early
    pub fn clear_failure(&self, backend: &str) {
        if self.disabled.remove(backend).is_some() {
            tracing::info!(backend = %backend, "Backend re-enabled");
        }
    }

    async fn passes_gates(&self, backend: &SharedBackend, options: &RouteOptions) -> bool {
        let name = backend.name();
        if !options.permits(name) {
            return false;
        }
        if let Some(remaining) = self.disabled_remaining(name) {
            tracing::debug!(
                backend = %name,
                remaining_secs = remaining.as_secs(),
                "Skipping temporarily disabled backend"
            );
            return false;
        }
        if !backend.is_healthy().await {
            tracing::debug!(backend = %name, "Skipping backend that reports unhealthy");
            return false;
        }
        true
    }

    async fn eligible(&self, options: &RouteOptions) -> Vec<SharedBackend> {
        let mut eligible = Vec::new();
        for backend in self.ordered_backends() {
            if self.passes_gates(&backend, options).await {
                eligible.push(backend);
            }
        }
        eligible
    }

    /// First successful answer in preference order
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AllBackendsFailed` naming every attempted
    /// backend when none succeeds.
    pub async fn generate(&self, prompt: &str) -> GatewayResult<RoutedResponse> {
        self.generate_with(prompt, &RouteOptions::all()).await
    }

    /// [`generate`](Self::generate) restricted by route options
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AllBackendsFailed` naming every attempted
    /// backend when none succeeds.
    pub async fn generate_with(
        &self,
        prompt: &str,
        options: &RouteOptions,
    ) -> GatewayResult<RoutedResponse> {
        let mut failures: Vec<BackendFailure> = Vec::new();

        for backend in self.ordered_backends() {
            if !self.passes_gates(&backend, options).await {
                continue;
            }
            let name = backend.name().to_string();
            if let (Some(metrics), Some(previous)) = (&self.metrics, failures.last()) {
                metrics.record_fallback(&previous.backend, &name);
            }

            match backend.generate(prompt).await {
                Ok(generation) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.total_routed.inc();
                    }
                    tracing::debug!(
                        backend = %name,
                        attempts = failures.len() + 1,
                        "Routed request"
                    );
                    return Ok(RoutedResponse {
                        backend: name,
                        generation,
                        score: None,
                    });
                }
                Err(error) => {
                    self.mark_failed(&name, &error);
                    failures.push(BackendFailure::new(name, error));
                }
            }
        }

        Err(GatewayError::AllBackendsFailed { failures })
    }

    /// Answers from every eligible backend, in preference order
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AllBackendsFailed` when no backend succeeds.
    pub async fn generate_from_all(&self, prompt: &str) -> GatewayResult<Vec<RoutedResponse>> {
        self.generate_from_all_with(prompt, &RouteOptions::all())
            .await
    }

    /// [`generate_from_all`](Self::generate_from_all) restricted by route options
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AllBackendsFailed` when no backend succeeds.
    pub async fn generate_from_all_with(
        &self,
        prompt: &str,
        options: &RouteOptions,
    ) -> GatewayResult<Vec<RoutedResponse>> {
        let candidates = self.eligible(options).await;
        let outcomes = join_all(candidates.iter().map(|b| b.generate(prompt))).await;

        let mut responses = Vec::new();
        let mut failures = Vec::new();
        for (backend, outcome) in candidates.iter().zip(outcomes) {
            let name = backend.name().to_string();
            match outcome {
                Ok(generation) => responses.push(RoutedResponse {
                    backend: name,
                    generation,
                    score: None,
                }),
                Err(error) => {
                    self.mark_failed(&name, &error);
                    failures.push(BackendFailure::new(name, error));
                }
            }
        }

        if responses.is_empty() {
            return Err(GatewayError::AllBackendsFailed { failures });
        }
        if let Some(metrics) = &self.metrics {
            metrics.total_routed.inc();
        }
        tracing::debug!(
            succeeded = responses.len(),
            failed = failures.len(),
            "Fan-out complete"
        );
        Ok(responses)
    }

    /// Highest-scoring answer across every eligible backend
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AllBackendsFailed` when no backend succeeds.
    pub async fn generate_best(&self, prompt: &str) -> GatewayResult<RoutedResponse> {
        self.generate_best_with(prompt, &RouteOptions::all()).await
    }

    /// [`generate_best`](Self::generate_best) restricted by route options
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::AllBackendsFailed` when no backend succeeds.
    pub async fn generate_best_with(
        &self,
        prompt: &str,
        options: &RouteOptions,
    ) -> GatewayResult<RoutedResponse> {
        let responses = self.generate_from_all_with(prompt, options).await?;

        let mut best: Option<RoutedResponse> = None;
        for mut response in responses {
            let score = score_response(&response.generation.content);
            response.score = Some(score);
            tracing::debug!(backend = %response.backend, score, "Scored candidate");

            let better = best
                .as_ref()
                .and_then(|b| b.score)
                .map_or(true, |best_score| score > best_score);
            if better {
                best = Some(response);
            }
        }

        best.ok_or(GatewayError::AllBackendsFailed { failures: vec![] })
    }
}

impl fmt::Debug for BackendRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRouter")
            .field("config", &self.config)
            .field("backends", &self.backend_names())
            .finish_non_exhaustive()
    }
}
