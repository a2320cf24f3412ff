//! Gateway Metrics
//!
//! Observability for backend traffic:
//! - Call latency distribution per backend
//! - Success and error counts, errors broken down by kind
//! - Token consumption
//! - Cache hits and misses, rate-limit denials
//! - Fallbacks taken by the router
//!
//! The registry is shared by handle (`Arc<GatewayMetrics>`) between the
//! monitoring decorator, the cache decorator, the rate limiter and the router.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::TokenUsage;
use crate::error::BackendError;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds (milliseconds)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Total count
    total_count: AtomicU64,
    /// Sum of all values
    sum: AtomicU64,
    /// Minimum value seen
    min: AtomicU64,
    /// Maximum value seen
    max: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets in milliseconds
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120_000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value.max(0.0) as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Point-in-time copy of the distribution
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    /// Upper bucket bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Number of samples
    pub total: u64,
    /// Sum of samples
    pub sum: u64,
    /// Smallest sample (0 when empty)
    pub min: u64,
    /// Largest sample
    pub max: u64,
    /// Arithmetic mean
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket containing the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Median
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 90th percentile
    #[must_use]
    pub fn p90(&self) -> f64 {
        self.percentile(0.9)
    }

    /// 99th percentile
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// New counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up or down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// New gauge at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Backend Metrics
// ============================================================================

/// Metrics for a single backend
#[derive(Debug)]
pub struct BackendMetrics {
    /// Backend name
    pub backend: String,
    /// Calls started
    pub requests: Counter,
    /// Calls that returned a response
    pub successes: Counter,
    /// Calls that returned an error
    pub failures: Counter,
    /// Call latency in milliseconds
    pub latency: Histogram,
    /// Prompt tokens reported by the backend
    pub prompt_tokens: Counter,
    /// Completion tokens reported by the backend
    pub completion_tokens: Counter,
    /// Responses served from cache
    pub cache_hits: Counter,
    /// Cache lookups that went to the backend
    pub cache_misses: Counter,
    /// Calls denied by the rate limiter
    pub rate_limited: Counter,
    /// Calls currently running
    pub in_flight: Gauge,
    /// Failure counts keyed by [`BackendError::kind`]
    errors_by_kind: Mutex<BTreeMap<&'static str, u64>>,
}

impl BackendMetrics {
    /// Empty metrics for a backend
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            requests: Counter::new(),
            successes: Counter::new(),
            failures: Counter::new(),
            latency: Histogram::latency_default(),
            prompt_tokens: Counter::new(),
            completion_tokens: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            rate_limited: Counter::new(),
            in_flight: Gauge::new(),
            errors_by_kind: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fraction of calls that failed
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.requests.get();
        if total == 0 {
            return 0.0;
        }
        self.failures.get() as f64 / total as f64
    }

    /// Failure count for one error kind
    #[must_use]
    pub fn errors_of_kind(&self, kind: &str) -> u64 {
        self.errors_by_kind.lock().get(kind).copied().unwrap_or(0)
    }

    /// Point-in-time summary
    #[must_use]
    pub fn summary(&self) -> BackendMetricsSummary {
        let latency = self.latency.snapshot();

        BackendMetricsSummary {
            backend: self.backend.clone(),
            total_requests: self.requests.get(),
            successful_requests: self.successes.get(),
            failed_requests: self.failures.get(),
            error_rate: self.error_rate(),
            errors_by_kind: self
                .errors_by_kind
                .lock()
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            latency_p50_ms: latency.p50(),
            latency_p90_ms: latency.p90(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
            prompt_tokens: self.prompt_tokens.get(),
            completion_tokens: self.completion_tokens.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            rate_limited: self.rate_limited.get(),
            in_flight: self.in_flight.get(),
        }
    }
}

/// Summary of backend metrics
#[derive(Clone, Debug, PartialEq)]
pub struct BackendMetricsSummary {
    /// Backend name
    pub backend: String,
    /// Calls started
    pub total_requests: u64,
    /// Calls that succeeded
    pub successful_requests: u64,
    /// Calls that failed
    pub failed_requests: u64,
    /// failed / total
    pub error_rate: f64,
    /// Failures keyed by error kind
    pub errors_by_kind: BTreeMap<String, u64>,
    /// Median latency
    pub latency_p50_ms: f64,
    /// 90th percentile latency
    pub latency_p90_ms: f64,
    /// 99th percentile latency
    pub latency_p99_ms: f64,
    /// Mean latency
    pub latency_mean_ms: f64,
    /// Prompt tokens consumed
    pub prompt_tokens: u64,
    /// Completion tokens produced
    pub completion_tokens: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Rate-limit denials
    pub rate_limited: u64,
    /// Calls currently running
    pub in_flight: u64,
}

// ============================================================================
// Gateway Metrics Registry
// ============================================================================

/// Centralized metrics for all backends
#[derive(Debug)]
pub struct GatewayMetrics {
    backends: DashMap<String, Arc<BackendMetrics>>,
    /// Times the router moved on to the next backend after a failure
    pub total_fallbacks: Counter,
    /// Requests routed through the router
    pub total_routed: Counter,
    started_at: Instant,
}

impl GatewayMetrics {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
            total_fallbacks: Counter::new(),
            total_routed: Counter::new(),
            started_at: Instant::now(),
        }
    }

    /// Get or create metrics for a backend
    pub fn backend(&self, name: &str) -> Arc<BackendMetrics> {
        if let Some(metrics) = self.backends.get(name) {
            return Arc::clone(metrics.value());
        }
        self.backends
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BackendMetrics::new(name)))
            .clone()
    }

    /// Record a call being started
    pub fn record_request_start(&self, backend: &str) {
        let metrics = self.backend(backend);
        metrics.requests.inc();
        metrics.in_flight.inc();
    }

    /// Record a completed call
    pub fn record_success(&self, backend: &str, elapsed: Duration, usage: Option<TokenUsage>) {
        let metrics = self.backend(backend);
        metrics.successes.inc();
        metrics.in_flight.dec();
        metrics.latency.record_duration(elapsed);
        if let Some(usage) = usage {
            metrics.prompt_tokens.add(u64::from(usage.prompt_tokens));
            metrics.completion_tokens.add(u64::from(usage.completion_tokens));
        }
    }

    /// Record a failed call, tagged by error kind
    pub fn record_failure(&self, backend: &str, elapsed: Duration, error: &BackendError) {
        let metrics = self.backend(backend);
        metrics.failures.inc();
        metrics.in_flight.dec();
        metrics.latency.record_duration(elapsed);
        *metrics.errors_by_kind.lock().entry(error.kind()).or_insert(0) += 1;
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self, backend: &str) {
        self.backend(backend).cache_hits.inc();
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self, backend: &str) {
        self.backend(backend).cache_misses.inc();
    }

    /// Record a rate-limit denial
    pub fn record_rate_limited(&self, backend: &str) {
        self.backend(backend).rate_limited.inc();
    }

    /// Record the router moving from one backend to the next
    pub fn record_fallback(&self, from_backend: &str, to_backend: &str) {
        self.total_fallbacks.inc();
        tracing::debug!(
            from = from_backend,
            to = to_backend,
            "Request fell back to alternate backend"
        );
    }

    /// Time since the registry was created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Summaries for every backend seen so far, sorted by name
    #[must_use]
    pub fn all_backend_summaries(&self) -> Vec<BackendMetricsSummary> {
        let mut summaries: Vec<_> = self.backends.iter().map(|m| m.summary()).collect();
        summaries.sort_by(|a, b| a.backend.cmp(&b.backend));
        summaries
    }

    /// Export as Prometheus text format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "# HELP gateway_routed_total Requests routed\n\
             # TYPE gateway_routed_total counter\n\
             gateway_routed_total {}\n\n",
            self.total_routed.get()
        );
        let _ = write!(
            output,
            "# HELP gateway_fallbacks_total Router fallbacks to an alternate backend\n\
             # TYPE gateway_fallbacks_total counter\n\
             gateway_fallbacks_total {}\n\n",
            self.total_fallbacks.get()
        );

        for summary in self.all_backend_summaries() {
            let name = &summary.backend;
            let _ = writeln!(
                output,
                "backend_requests_total{{backend=\"{name}\"}} {}",
                summary.total_requests
            );
            let _ = writeln!(
                output,
                "backend_errors_total{{backend=\"{name}\"}} {}",
                summary.failed_requests
            );
            for (kind, count) in &summary.errors_by_kind {
                let _ = writeln!(
                    output,
                    "backend_errors_by_kind_total{{backend=\"{name}\",kind=\"{kind}\"}} {count}"
                );
            }
            let _ = writeln!(
                output,
                "backend_latency_p50_ms{{backend=\"{name}\"}} {}",
                summary.latency_p50_ms
            );
            let _ = writeln!(
                output,
                "backend_latency_p99_ms{{backend=\"{name}\"}} {}",
                summary.latency_p99_ms
            );
            let _ = writeln!(
                output,
                "backend_tokens_total{{backend=\"{name}\",type=\"prompt\"}} {}",
                summary.prompt_tokens
            );
            let _ = writeln!(
                output,
                "backend_tokens_total{{backend=\"{name}\",type=\"completion\"}} {}",
                summary.completion_tokens
            );
            let _ = writeln!(
                output,
                "backend_cache_hits_total{{backend=\"{name}\"}} {}\n",
                summary.cache_hits
            );
        }

        output
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
