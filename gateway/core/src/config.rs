//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, supporting a TOML file
//! at `~/.config/llm-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. Host overrides ([`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! ttl_secs = 86400
//! max_size = 1000
//!
//! [rate_limit]
//! enabled = true
//! requests_per_minute = 60
//! concurrent_requests = 10
//! adaptive_throttling = true
//!
//! [health]
//! check_timeout_ms = 5000
//! failure_threshold = 3
//! failure_window_secs = 300
//! cache_duration_secs = 60
//!
//! [routing]
//! preference = ["local", "hosted"]
//! allow_all = false
//! disable_window_secs = 300
//! backend_timeout_ms = 30000
//!
//! [routing.weights]
//! hosted = 0.5
//!
//! [evaluation]
//! acceptable_score_threshold = 0.7
//! memory_key_prefix = "gateway:output"
//! best_of_by_default = false
//! strict_optimization = false
//! ```
//!
//! Each option except `routing.weights` and `routing.allow_all` also has a
//! `GATEWAY_*` environment variable, e.g. `GATEWAY_CACHE_TTL_SECS` or
//! `GATEWAY_STRICT_OPTIMIZATION`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adaptive::EvaluationConfig;
use crate::health::HealthConfig;
use crate::resilience::cache::CacheConfig;
use crate::resilience::rate_limit::RateLimitConfig;
use crate::router::{Preference, RouterConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks which layer last changed the configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Host-supplied overrides
    Overrides,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overrides => write!(f, "overrides"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Whether responses are cached
    pub enabled: Option<bool>,
    /// Entry lifetime in seconds
    pub ttl_secs: Option<u64>,
    /// Maximum number of entries
    pub max_size: Option<usize>,
}

/// `[rate_limit]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    /// Whether the rate-limit layer is installed
    pub enabled: Option<bool>,
    /// Admissions per minute per backend
    pub requests_per_minute: Option<u32>,
    /// Concurrent calls per backend
    pub concurrent_requests: Option<usize>,
    /// Adapt the limit to successes and failures
    pub adaptive_throttling: Option<bool>,
}

/// `[health]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Probe timeout in milliseconds
    pub check_timeout_ms: Option<u64>,
    /// Failures before a backend is unhealthy
    pub failure_threshold: Option<u32>,
    /// How long a failure counts, in seconds
    pub failure_window_secs: Option<u64>,
    /// How long `check_all_providers` results are reused, in seconds
    pub cache_duration_secs: Option<u64>,
}

/// `[routing]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Backends in preference order
    pub preference: Option<Vec<String>>,
    /// Explicit per-backend weights
    pub weights: Option<HashMap<String, f64>>,
    /// Allow backends not named in the preference
    pub allow_all: Option<bool>,
    /// How long a failed backend is skipped, in seconds
    pub disable_window_secs: Option<u64>,
    /// Per-call deadline in milliseconds (no deadline when absent)
    pub backend_timeout_ms: Option<u64>,
}

/// `[evaluation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationToml {
    /// Minimum score for acceptance
    pub acceptable_score_threshold: Option<f64>,
    /// Prefix for persisted output keys
    pub memory_key_prefix: Option<String>,
    /// Use best-of routing by default
    pub best_of_by_default: Option<bool>,
    /// Fail requests when prompt optimization fails
    pub strict_optimization: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Cache section
    pub cache: CacheToml,
    /// Rate limit section
    pub rate_limit: RateLimitToml,
    /// Health section
    pub health: HealthToml,
    /// Routing section
    pub routing: RoutingToml,
    /// Evaluation section
    pub evaluation: EvaluationToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Complete gateway configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Response cache
    pub cache: CacheConfig,

    /// Per-backend rate limiting
    pub rate_limit: RateLimitConfig,

    /// Whether the rate-limit layer is installed
    pub rate_limit_enabled: bool,

    /// Health tracking
    pub health: HealthConfig,

    /// Routing
    pub router: RouterConfig,

    /// Adaptive loop
    pub evaluation: EvaluationConfig,

    /// Per-call deadline; `None` installs no timeout layer
    pub backend_timeout: Option<Duration>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            rate_limit_enabled: true,
            health: HealthConfig::default(),
            router: RouterConfig::default(),
            evaluation: EvaluationConfig::default(),
            backend_timeout: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer that last changed this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.cache.enabled && self.cache.max_size == 0 {
            return invalid("cache.max_size must be greater than 0");
        }
        if self.cache.enabled && self.cache.ttl.is_zero() {
            return invalid("cache.ttl_secs must be greater than 0");
        }
        if self.rate_limit.requests_per_minute == 0 {
            return invalid("rate_limit.requests_per_minute must be greater than 0");
        }
        if self.rate_limit.concurrent_requests == 0 {
            return invalid("rate_limit.concurrent_requests must be greater than 0");
        }
        if self.health.failure_threshold == 0 {
            return invalid("health.failure_threshold must be greater than 0");
        }
        if self.health.check_timeout.is_zero() {
            return invalid("health.check_timeout_ms must be greater than 0");
        }
        if self.backend_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("routing.backend_timeout_ms must be greater than 0");
        }
        let threshold = self.evaluation.acceptable_score_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::ValidationError(format!(
                "evaluation.acceptable_score_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.evaluation.memory_key_prefix.trim().is_empty() {
            return invalid("evaluation.memory_key_prefix must not be empty");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/llm-gateway/gateway.toml`, typically
/// `~/.config/llm-gateway/gateway.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-gateway").join("gateway.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are invalid. A missing file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the
/// resulting values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

fn load_config_with_env<F>(path: Option<PathBuf>, lookup: F) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config_from(&mut config, lookup);
    config.validate()?;
    Ok(config)
}

/// Apply TOML values over the current configuration
pub fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    // Cache
    if let Some(enabled) = toml.cache.enabled {
        config.cache.enabled = enabled;
    }
    if let Some(ttl) = toml.cache.ttl_secs {
        config.cache.ttl = Duration::from_secs(ttl);
    }
    if let Some(max_size) = toml.cache.max_size {
        config.cache.max_size = max_size;
    }

    // Rate limit
    if let Some(enabled) = toml.rate_limit.enabled {
        config.rate_limit_enabled = enabled;
    }
    if let Some(rpm) = toml.rate_limit.requests_per_minute {
        config.rate_limit.requests_per_minute = rpm;
    }
    if let Some(concurrent) = toml.rate_limit.concurrent_requests {
        config.rate_limit.concurrent_requests = concurrent;
    }
    if let Some(adaptive) = toml.rate_limit.adaptive_throttling {
        config.rate_limit.adaptive_throttling = adaptive;
    }

    // Health
    if let Some(ms) = toml.health.check_timeout_ms {
        config.health.check_timeout = Duration::from_millis(ms);
    }
    if let Some(threshold) = toml.health.failure_threshold {
        config.health.failure_threshold = threshold;
    }
    if let Some(secs) = toml.health.failure_window_secs {
        config.health.failure_window = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.health.cache_duration_secs {
        config.health.cache_duration = Duration::from_secs(secs);
    }

    // Routing
    let routing = &toml.routing;
    if routing.preference.is_some() || routing.weights.is_some() || routing.allow_all.is_some() {
        let mut preference = Preference::ordered(routing.preference.clone().unwrap_or_default());
        for (name, weight) in routing.weights.iter().flatten() {
            preference = preference.with_weight(name.clone(), *weight);
        }
        if let Some(allow_all) = routing.allow_all {
            preference = preference.with_allow_all(allow_all);
        }
        config.router.preference = preference;
    }
    if let Some(secs) = routing.disable_window_secs {
        config.router.disable_window = Duration::from_secs(secs);
    }
    if let Some(ms) = routing.backend_timeout_ms {
        config.backend_timeout = Some(Duration::from_millis(ms));
    }

    // Evaluation
    if let Some(threshold) = toml.evaluation.acceptable_score_threshold {
        config.evaluation.acceptable_score_threshold = threshold;
    }
    if let Some(ref prefix) = toml.evaluation.memory_key_prefix {
        config.evaluation.memory_key_prefix.clone_from(prefix);
    }
    if let Some(best_of) = toml.evaluation.best_of_by_default {
        config.evaluation.best_of_by_default = best_of;
    }
    if let Some(strict) = toml.evaluation.strict_optimization {
        config.evaluation.strict_optimization = strict;
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Apply `GATEWAY_*` variables read through `lookup`
///
/// Unparseable values are logged and ignored.
pub fn apply_env_config_from<F>(config: &mut GatewayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(variable = key, value = %raw, "Ignoring unparseable environment value");
                None
            }
        }
    }

    let mut touched = false;

    if let Some(enabled) = lookup("GATEWAY_CACHE_ENABLED") {
        config.cache.enabled = parse_flag(&enabled);
        touched = true;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "GATEWAY_CACHE_TTL_SECS") {
        config.cache.ttl = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(size) = parsed::<usize>(&lookup, "GATEWAY_CACHE_MAX_SIZE") {
        config.cache.max_size = size;
        touched = true;
    }
    if let Some(enabled) = lookup("GATEWAY_RATE_LIMIT_ENABLED") {
        config.rate_limit_enabled = parse_flag(&enabled);
        touched = true;
    }
    if let Some(rpm) = parsed::<u32>(&lookup, "GATEWAY_RATE_LIMIT_RPM") {
        config.rate_limit.requests_per_minute = rpm;
        touched = true;
    }
    if let Some(concurrent) = parsed::<usize>(&lookup, "GATEWAY_RATE_LIMIT_CONCURRENT") {
        config.rate_limit.concurrent_requests = concurrent;
        touched = true;
    }
    if let Some(adaptive) = lookup("GATEWAY_ADAPTIVE_THROTTLING") {
        config.rate_limit.adaptive_throttling = parse_flag(&adaptive);
        touched = true;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "GATEWAY_HEALTH_CHECK_TIMEOUT_MS") {
        config.health.check_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(threshold) = parsed::<u32>(&lookup, "GATEWAY_FAILURE_THRESHOLD") {
        config.health.failure_threshold = threshold;
        touched = true;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "GATEWAY_FAILURE_WINDOW_SECS") {
        config.health.failure_window = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "GATEWAY_HEALTH_CACHE_SECS") {
        config.health.cache_duration = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(names) = lookup("GATEWAY_PREFERENCE") {
        let names: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        config.router.preference = Preference::ordered(names);
        touched = true;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "GATEWAY_DISABLE_WINDOW_SECS") {
        config.router.disable_window = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "GATEWAY_BACKEND_TIMEOUT_MS") {
        config.backend_timeout = Some(Duration::from_millis(ms));
        touched = true;
    }
    if let Some(threshold) = parsed::<f64>(&lookup, "GATEWAY_SCORE_THRESHOLD") {
        config.evaluation.acceptable_score_threshold = threshold;
        touched = true;
    }
    if let Some(prefix) = lookup("GATEWAY_MEMORY_KEY_PREFIX") {
        config.evaluation.memory_key_prefix = prefix.trim().to_string();
        touched = true;
    }
    if let Some(best_of) = lookup("GATEWAY_BEST_OF_BY_DEFAULT") {
        config.evaluation.best_of_by_default = parse_flag(&best_of);
        touched = true;
    }
    if let Some(strict) = lookup("GATEWAY_STRICT_OPTIMIZATION") {
        config.evaluation.strict_optimization = parse_flag(&strict);
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Override Support
// =============================================================================

/// Host-supplied overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Preference order override
    pub preference: Option<Vec<String>>,

    /// Cache enabled override
    pub cache_enabled: Option<bool>,

    /// Rate limiting enabled override
    pub rate_limit_enabled: Option<bool>,

    /// Per-call deadline override
    pub backend_timeout: Option<Duration>,

    /// Acceptance threshold override
    pub acceptable_score_threshold: Option<f64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set preference order override
    #[must_use]
    pub fn with_preference<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preference = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Set cache enabled override
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    /// Set rate limiting enabled override
    #[must_use]
    pub fn with_rate_limit_enabled(mut self, enabled: bool) -> Self {
        self.rate_limit_enabled = Some(enabled);
        self
    }

    /// Set per-call deadline override
    #[must_use]
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = Some(timeout);
        self
    }

    /// Set acceptance threshold override
    #[must_use]
    pub fn with_acceptable_score_threshold(mut self, threshold: f64) -> Self {
        self.acceptable_score_threshold = Some(threshold);
        self
    }

    fn is_empty(&self) -> bool {
        self.preference.is_none()
            && self.cache_enabled.is_none()
            && self.rate_limit_enabled.is_none()
            && self.backend_timeout.is_none()
            && self.acceptable_score_threshold.is_none()
    }

    /// Apply overrides and re-validate
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if an override is out of range.
    pub fn apply(&self, config: &mut GatewayConfig) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        config.source = ConfigSource::Overrides;

        if let Some(ref names) = self.preference {
            config.router.preference = Preference::ordered(names.clone());
        }
        if let Some(enabled) = self.cache_enabled {
            config.cache.enabled = enabled;
        }
        if let Some(enabled) = self.rate_limit_enabled {
            config.rate_limit_enabled = enabled;
        }
        if let Some(timeout) = self.backend_timeout {
            config.backend_timeout = Some(timeout);
        }
        if let Some(threshold) = self.acceptable_score_threshold {
            config.evaluation.acceptable_score_threshold = threshold;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
