//! Backend Health Tracking
//!
//! Tracks backend liveness over a sliding failure window:
//!
//! - Every failure is timestamped; records older than the window are pruned
//!   before any read, so status is always derived from in-window failures.
//! - Status thresholds:
//!
//! ```text
//! in-window failures:   0          1 .. threshold-1        >= threshold
//!                    Healthy  ->      Degraded        ->     Unhealthy
//! ```
//!
//! - Probes send a fixed synthetic prompt with a hard timeout. A failed or
//!   timed-out probe records a failure; a successful one clears nothing.
//! - `check_all_providers` probes every backend concurrently and stores the
//!   results in an injected [`HealthCheckCache`] that is refreshed as a whole.
//!
//! # Thread Safety
//!
//! Per-backend failure logs live in a `DashMap`, each behind its own
//! `parking_lot::Mutex`; no lock is held across an await point.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::backend::SharedBackend;
use crate::error::{GatewayError, GatewayResult};

/// Synthetic prompt sent by health probes
pub const HEALTH_CHECK_PROMPT: &str = "health check test";

// ============================================================================
// Health Status
// ============================================================================

/// Health status of a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// No failures in the window
    Healthy,

    /// Some failures, below the threshold
    Degraded,

    /// At or above the failure threshold
    Unhealthy,
}

impl HealthStatus {
    /// Derive status from an in-window failure count
    #[must_use]
    pub fn from_failure_count(failures: usize, threshold: u32) -> Self {
        if failures == 0 {
            Self::Healthy
        } else if failures < threshold as usize {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    /// Whether the backend should still receive traffic
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Lowercase label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for health tracking behavior
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthConfig {
    /// Hard deadline for one probe
    pub check_timeout: Duration,

    /// In-window failures at which a backend becomes unhealthy
    pub failure_threshold: u32,

    /// How long a failure counts
    pub failure_window: Duration,

    /// How long `check_all_providers` results are reused
    pub cache_duration: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            failure_window: Duration::from_secs(5 * 60),
            cache_duration: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    /// Set the probe timeout
    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Set the unhealthy threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the failure window
    #[must_use]
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Set the result cache window
    #[must_use]
    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }
}

// ============================================================================
// Failure Log
// ============================================================================

/// Timestamped failures for one backend
#[derive(Debug, Default)]
struct FailureLog {
    failures: Mutex<VecDeque<Instant>>,
}

impl FailureLog {
    fn prune(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = queue.front() {
            if now.duration_since(oldest) >= window {
                queue.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut failures = self.failures.lock();
        Self::prune(&mut failures, now, window);
        failures.push_back(now);
        failures.len()
    }

    fn count(&self, window: Duration) -> usize {
        let mut failures = self.failures.lock();
        Self::prune(&mut failures, Instant::now(), window);
        failures.len()
    }

    fn last_failure(&self) -> Option<Instant> {
        self.failures.lock().back().copied()
    }
}

// ============================================================================
// Check Results and Cache
// ============================================================================

/// Outcome of probing one backend
#[derive(Clone, Debug, PartialEq)]
pub struct HealthCheckResult {
    /// Backend name
    pub backend: String,
    /// Status after the probe was accounted for
    pub status: HealthStatus,
    /// Whether the probe itself succeeded
    pub probe_succeeded: bool,
    /// Probe duration
    pub response_time: Duration,
    /// In-window failures after the probe
    pub failure_count: usize,
    /// Probe error, if any
    pub error: Option<String>,
    /// Wall-clock time of the probe
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Probe succeeded and status still allows traffic
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.probe_succeeded && self.status.is_operational()
    }
}

#[derive(Debug, Default)]
struct CachedResults {
    refreshed_at: Option<Instant>,
    results: HashMap<String, HealthCheckResult>,
}

/// Shared cache for `check_all_providers` results
///
/// All entries share one refresh time; once it is older than the window the
/// whole set is discarded and refreshed together.
#[derive(Debug)]
pub struct HealthCheckCache {
    window: Duration,
    state: Mutex<CachedResults>,
}

impl HealthCheckCache {
    /// Empty cache with the given freshness window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(CachedResults::default()),
        }
    }

    /// Freshness window
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// All results, if the set is still fresh
    #[must_use]
    pub fn fresh_results(&self) -> Option<HashMap<String, HealthCheckResult>> {
        let mut state = self.state.lock();
        match state.refreshed_at {
            Some(at) if at.elapsed() < self.window => Some(state.results.clone()),
            Some(_) => {
                state.refreshed_at = None;
                state.results.clear();
                None
            }
            None => None,
        }
    }

    /// Result for one backend, if the set is still fresh
    #[must_use]
    pub fn get(&self, backend: &str) -> Option<HealthCheckResult> {
        let state = self.state.lock();
        match state.refreshed_at {
            Some(at) if at.elapsed() < self.window => state.results.get(backend).cloned(),
            _ => None,
        }
    }

    /// Replace the whole set
    pub fn store(&self, results: HashMap<String, HealthCheckResult>) {
        let mut state = self.state.lock();
        state.results = results;
        state.refreshed_at = Some(Instant::now());
    }

    /// Drop everything
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.refreshed_at = None;
        state.results.clear();
    }
}

impl Default for HealthCheckCache {
    fn default() -> Self {
        Self::new(HealthConfig::default().cache_duration)
    }
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Diagnostic view of one backend's health
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Backend name
    pub backend: String,
    /// Current status
    pub status: HealthStatus,
    /// In-window failures
    pub failure_count: usize,
    /// Time since the most recent failure
    pub since_last_failure: Option<Duration>,
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Failure-window health tracking and probing for registered backends
pub struct HealthMonitor {
    config: HealthConfig,
    backends: DashMap<String, SharedBackend>,
    /// Registration order
    order: RwLock<Vec<String>>,
    failures: DashMap<String, Arc<FailureLog>>,
    cache: Arc<HealthCheckCache>,
}

impl HealthMonitor {
    /// Create a monitor using a caller-owned result cache
    #[must_use]
    pub fn new(config: HealthConfig, cache: Arc<HealthCheckCache>) -> Self {
        Self {
            config,
            backends: DashMap::new(),
            order: RwLock::new(Vec::new()),
            failures: DashMap::new(),
            cache,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// The injected result cache
    #[must_use]
    pub fn cache(&self) -> Arc<HealthCheckCache> {
        Arc::clone(&self.cache)
    }

    /// Register a backend for probing
    ///
    /// Probes go straight to this handle, so register the undecorated backend
    /// to keep probes out of the cache and the rate limiter.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::DuplicateBackend` if the name is taken.
    pub fn register(&self, backend: SharedBackend) -> GatewayResult<()> {
        let name = backend.name().to_string();
        let mut order = self.order.write();
        if self.backends.contains_key(&name) {
            return Err(GatewayError::DuplicateBackend(name));
        }
        self.backends.insert(name.clone(), backend);
        order.push(name);
        Ok(())
    }

    /// Registered backend names in registration order
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    fn log(&self, backend: &str) -> Arc<FailureLog> {
        if let Some(log) = self.failures.get(backend) {
            return Arc::clone(log.value());
        }
        self.failures
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(FailureLog::default()))
            .clone()
    }

    /// Record a failure now; returns the in-window count
    pub fn record_failure(&self, backend: &str) -> usize {
        let count = self.log(backend).record(self.config.failure_window);
        let status = HealthStatus::from_failure_count(count, self.config.failure_threshold);
        if status == HealthStatus::Unhealthy {
            tracing::warn!(
                backend = %backend,
                failures = count,
                threshold = self.config.failure_threshold,
                "Backend marked unhealthy"
            );
        } else {
            tracing::debug!(backend = %backend, failures = count, "Recorded backend failure");
        }
        count
    }

    /// In-window failure count
    #[must_use]
    pub fn failure_count(&self, backend: &str) -> usize {
        self.failures
            .get(backend)
            .map(|log| Arc::clone(log.value()))
            .map_or(0, |log| log.count(self.config.failure_window))
    }

    /// Current status from in-window failures
    #[must_use]
    pub fn status(&self, backend: &str) -> HealthStatus {
        HealthStatus::from_failure_count(self.failure_count(backend), self.config.failure_threshold)
    }

    /// Whether the status still allows traffic
    #[must_use]
    pub fn is_operational(&self, backend: &str) -> bool {
        self.status(backend).is_operational()
    }

    /// Operational backends in registration order
    #[must_use]
    pub fn healthy_backends(&self) -> Vec<String> {
        self.backend_names()
            .into_iter()
            .filter(|name| self.is_operational(name))
            .collect()
    }

    /// Drop out-of-window failures for every backend
    pub fn prune(&self) {
        for log in &self.failures {
            log.count(self.config.failure_window);
        }
    }

    /// Diagnostic view of one backend
    #[must_use]
    pub fn snapshot(&self, backend: &str) -> HealthSnapshot {
        let failure_count = self.failure_count(backend);
        let since_last_failure = self
            .failures
            .get(backend)
            .and_then(|log| log.last_failure())
            .filter(|_| failure_count > 0)
            .map(|at| at.elapsed());

        HealthSnapshot {
            backend: backend.to_string(),
            status: HealthStatus::from_failure_count(failure_count, self.config.failure_threshold),
            failure_count,
            since_last_failure,
        }
    }

    /// Diagnostic views in registration order
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        self.backend_names()
            .iter()
            .map(|name| self.snapshot(name))
            .collect()
    }

    /// Probe one backend
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::UnknownBackend` if the name is not registered.
    pub async fn check_health(&self, backend: &str) -> GatewayResult<HealthCheckResult> {
        let handle = self
            .backends
            .get(backend)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))?;

        let started = Instant::now();
        let probe = tokio::time::timeout(
            self.config.check_timeout,
            handle.generate(HEALTH_CHECK_PROMPT),
        )
        .await;
        let response_time = started.elapsed();

        let error = match probe {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "health check timed out after {}ms",
                self.config.check_timeout.as_millis()
            )),
        };
        if let Some(reason) = &error {
            tracing::warn!(backend = %backend, error = %reason, "Health probe failed");
            self.record_failure(backend);
        }

        let failure_count = self.failure_count(backend);
        Ok(HealthCheckResult {
            backend: backend.to_string(),
            status: HealthStatus::from_failure_count(
                failure_count,
                self.config.failure_threshold,
            ),
            probe_succeeded: error.is_none(),
            response_time,
            failure_count,
            error,
            checked_at: Utc::now(),
        })
    }

    /// Probe every registered backend concurrently, reusing fresh cached results
    pub async fn check_all_providers(&self) -> HashMap<String, HealthCheckResult> {
        if let Some(results) = self.cache.fresh_results() {
            tracing::trace!(backends = results.len(), "Using cached health results");
            return results;
        }

        let names = self.backend_names();
        let checks = names.iter().map(|name| self.check_health(name));
        let results: HashMap<String, HealthCheckResult> = join_all(checks)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .map(|result| (result.backend.clone(), result))
            .collect();

        let healthy = results.values().filter(|r| r.is_healthy()).count();
        tracing::info!(
            backends = results.len(),
            healthy,
            "Refreshed backend health"
        );

        self.cache.store(results.clone());
        results
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("backends", &self.backend_names())
            .finish_non_exhaustive()
    }
}
