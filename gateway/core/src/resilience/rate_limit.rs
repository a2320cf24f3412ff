//! Per-Backend Rate Limiting
//!
//! Protects each backend with two independent mechanisms:
//!
//! - A sliding window of admission timestamps. A request is rejected with
//!   [`BackendError::RateLimitExceeded`] when the window already holds as many
//!   entries as the current limit. Rejection is immediate; the caller gets the
//!   time until the oldest entry leaves the window.
//! - A concurrency semaphore. Admitted requests wait for a free slot.
//!
//! # Adaptive throttling
//!
//! The limit starts at the configured requests-per-minute ceiling. Each
//! failure lowers it by the number of consecutive failures (floor 1); each
//! success resets the failure streak and raises it by one (up to the ceiling).
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::{RateLimitConfig, RateLimitedBackend};
//!
//! let config = RateLimitConfig::new()
//!     .with_requests_per_minute(30)
//!     .with_concurrent_requests(4);
//! let limited = RateLimitedBackend::new(backend, config);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::backend::{Generation, LlmBackend, SharedBackend};
use crate::error::BackendError;
use crate::metrics::GatewayMetrics;

// =============================================================================
// Configuration
// =============================================================================

/// Rate limiting configuration, applied to each backend separately
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum admissions per window; also the adaptive ceiling
    pub requests_per_minute: u32,

    /// Maximum calls running at once
    pub concurrent_requests: usize,

    /// Whether the limit adapts to successes and failures
    pub adaptive_throttling: bool,

    /// Sliding window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            concurrent_requests: 10,
            adaptive_throttling: true,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-window admission limit
    #[must_use]
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Set the concurrency bound
    #[must_use]
    pub fn with_concurrent_requests(mut self, concurrent: usize) -> Self {
        self.concurrent_requests = concurrent;
        self
    }

    /// Enable or disable adaptive throttling
    #[must_use]
    pub fn with_adaptive_throttling(mut self, adaptive: bool) -> Self {
        self.adaptive_throttling = adaptive;
        self
    }

    /// Set the window length
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

// =============================================================================
// Limiter State
// =============================================================================

/// Mutable limiter state for one backend
#[derive(Debug)]
pub struct RateLimiterState {
    backend: String,
    config: RateLimitConfig,
    admitted_at: Mutex<VecDeque<Instant>>,
    slots: Arc<Semaphore>,
    consecutive_failures: AtomicU32,
    current_limit: AtomicU32,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

impl RateLimiterState {
    /// Fresh state for a backend
    pub fn new(backend: impl Into<String>, config: RateLimitConfig) -> Self {
        let ceiling = config.requests_per_minute.max(1);
        let slots = Arc::new(Semaphore::new(config.concurrent_requests.max(1)));
        Self {
            backend: backend.into(),
            admitted_at: Mutex::new(VecDeque::new()),
            slots,
            consecutive_failures: AtomicU32::new(0),
            current_limit: AtomicU32::new(ceiling),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            config,
        }
    }

    /// Backend this state belongs to
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Current adaptive limit
    #[must_use]
    pub fn current_limit(&self) -> u32 {
        self.current_limit.load(Ordering::Acquire)
    }

    /// Failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Admissions still inside the window
    #[must_use]
    pub fn in_window(&self) -> usize {
        let mut queue = self.admitted_at.lock();
        self.prune(&mut queue, Instant::now());
        queue.len()
    }

    /// Free concurrency slots
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Total (admitted, rejected) counts
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_admitted.load(Ordering::Relaxed),
            self.total_rejected.load(Ordering::Relaxed),
        )
    }

    fn prune(&self, queue: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = queue.front() {
            if now.duration_since(oldest) >= self.config.window {
                queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an admission if the window has room
    ///
    /// # Errors
    ///
    /// Returns `BackendError::RateLimitExceeded` when the window is full.
    pub fn try_admit(&self) -> Result<(), BackendError> {
        let now = Instant::now();
        let limit = self.current_limit() as usize;
        let mut queue = self.admitted_at.lock();
        self.prune(&mut queue, now);

        if queue.len() >= limit {
            let retry_after = queue
                .front()
                .map_or(self.config.window, |&oldest| {
                    self.config.window.saturating_sub(now.duration_since(oldest))
                });
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BackendError::RateLimitExceeded {
                backend: self.backend.clone(),
                retry_after,
            });
        }

        queue.push_back(now);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Admit, then wait for a concurrency slot
    ///
    /// # Errors
    ///
    /// Returns `BackendError::RateLimitExceeded` when the window is full.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BackendError> {
        self.try_admit()?;
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Internal("rate limiter slots closed".to_string()))
    }

    /// Reset the failure streak and grow the limit
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.config.adaptive_throttling {
            let ceiling = self.config.requests_per_minute.max(1);
            let _ = self
                .current_limit
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                    Some(limit.saturating_add(1).min(ceiling))
                });
        }
    }

    /// Extend the failure streak and shrink the limit by it
    pub fn record_failure(&self) {
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if self.config.adaptive_throttling {
            let _ = self
                .current_limit
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                    Some(limit.saturating_sub(failures).max(1))
                });
            tracing::debug!(
                backend = %self.backend,
                consecutive_failures = failures,
                limit = self.current_limit(),
                "Adaptive rate limit lowered"
            );
        }
    }
}

// =============================================================================
// Rate Limiting Decorator
// =============================================================================

/// Applies a [`RateLimiterState`] around every call
pub struct RateLimitedBackend {
    inner: SharedBackend,
    state: Arc<RateLimiterState>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl RateLimitedBackend {
    /// Wrap a backend with fresh limiter state
    pub fn new(inner: SharedBackend, config: RateLimitConfig) -> Self {
        let state = Arc::new(RateLimiterState::new(inner.name(), config));
        Self::with_state(inner, state)
    }

    /// Wrap a backend with existing limiter state
    pub fn with_state(inner: SharedBackend, state: Arc<RateLimiterState>) -> Self {
        Self {
            inner,
            state,
            metrics: None,
        }
    }

    /// Report denials to a metrics registry
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Limiter state handle
    #[must_use]
    pub fn state(&self) -> Arc<RateLimiterState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl LlmBackend for RateLimitedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError> {
        let permit = match self.state.acquire().await {
            Ok(permit) => permit,
            Err(error) => {
                tracing::warn!(
                    backend = %self.name(),
                    retry_after_ms = error.retry_after().map_or(0, |d| d.as_millis()),
                    "Rate limit exceeded"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_rate_limited(self.name());
                }
                return Err(error);
            }
        };

        let result = self.inner.generate(prompt).await;
        drop(permit);

        match &result {
            Ok(_) => self.state.record_success(),
            Err(_) => self.state.record_failure(),
        }
        result
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }
}
