//! Gateway Core - Resilient Multi-Backend Routing for Text Generation
//!
//! This crate sits between application callers and a set of interchangeable
//! text-generation backends. Callers submit a prompt; the gateway decides which
//! backend(s) serve it, applies backpressure, keeps failing backends out of
//! rotation, caches identical requests, scores competing answers, and retries
//! with feedback when an answer is judged unacceptable.
//!
//! # Architecture
//!
//! ```text
//! +------------------------+
//! |  AdaptiveLoop          |  <-- optimize -> generate -> evaluate -> retry
//! +-----------+------------+
//!             |
//!             v
//! +------------------------+      +------------------+
//! |  BackendRouter         | ---> |  HealthMonitor   |  failure windows, probes
//! +-----------+------------+      +------------------+
//!             |  preference order, temporary disable, fan-out
//!             v
//! +------------------------+
//! |  MonitoredBackend      |  latency, counters, tokens
//! |   CachingBackend       |  content-hash cache, earliest-expiry eviction
//! |    RateLimitedBackend  |  sliding window + concurrency slots
//! |     TimeoutBackend     |  optional call deadline
//! |      dyn LlmBackend    |  vendor adapter (external)
//! +------------------------+
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::{GatewayBuilder, GatewayConfig};
//!
//! let gateway = GatewayBuilder::new(GatewayConfig::default())
//!     .backend(Arc::new(my_openai_adapter))
//!     .backend(Arc::new(my_local_adapter))
//!     .build()?;
//!
//! let routed = gateway.router().generate_best("Explain borrowing").await?;
//! println!("{} answered: {}", routed.backend, routed.generation.content);
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: the `LlmBackend` capability and response types
//! - [`resilience`]: cache, rate-limit, monitoring and timeout decorators
//! - [`health`]: failure-window health tracking and probes
//! - [`router`]: preference ordering, fallback and best-of selection
//! - [`scorer`]: heuristic response quality scoring
//! - [`adaptive`]: evaluate/retry loop over the router
//! - [`memory`]: key-value persistence interface for final outputs
//! - [`metrics`]: per-backend counters and latency histograms
//! - [`config`]: TOML/env configuration loading
//! - [`gateway`]: explicit wiring of all of the above
//! - [`telemetry`]: tracing subscriber setup for hosts

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adaptive;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod resilience;
pub mod router;
pub mod scorer;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenience
pub use adaptive::{
    AdaptiveLoop, AdaptiveOutcome, AdaptiveRequest, EvaluationConfig, EvaluationResult,
    Evaluator, LoopState, OptimizedPrompt, Optimizer, OutputRecord,
};
pub use backend::{Generation, LlmBackend, SharedBackend, TokenUsage};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GatewayConfig, GatewayToml,
};
pub use error::{BackendError, BackendFailure, GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayBuilder};
pub use health::{
    HealthCheckCache, HealthCheckResult, HealthConfig, HealthMonitor, HealthStatus,
    HEALTH_CHECK_PROMPT,
};
pub use memory::{InMemoryStore, KeyValueMemory};
pub use metrics::{BackendMetricsSummary, GatewayMetrics};
pub use resilience::cache::{CacheConfig, CachingBackend, ResponseCache};
pub use resilience::monitoring::MonitoredBackend;
pub use resilience::rate_limit::{RateLimitConfig, RateLimitedBackend, RateLimiterState};
pub use resilience::timeout::TimeoutBackend;
pub use resilience::{decorate, DecoratedBackend, ResilienceLayers};
pub use router::{BackendRouter, Preference, RouteOptions, RoutedResponse, RouterConfig};
pub use scorer::{score_response, ScoreBreakdown};
