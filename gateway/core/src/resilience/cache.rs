//! Response caching with earliest-expiry eviction
//!
//! Identical requests to the same backend are served from memory instead of
//! hitting the backend again.
//!
//! # Design
//!
//! - **Content keys**: SHA-256 over the backend name and the normalized prompt
//!   (trimmed, whitespace runs collapsed). Case is preserved.
//! - **Lazy expiry**: an expired entry is never returned; reading it removes it.
//! - **Capacity**: when full, the entry with the soonest expiration is evicted
//!   before inserting. This is not LRU; a hot entry close to expiry goes first.
//! - **Errors are never cached**.
//!
//! # Concurrency
//!
//! The cache is a sharded `DashMap`; concurrent misses for the same key may
//! both reach the backend, and the last writer wins. Writes lock only the
//! key's shard: an overwrite or an insert into a free slot goes through the
//! shard's entry API, with capacity reserved from an atomic slot counter.
//! Only a full cache takes `evict_lock`, which serializes the
//! evict-then-insert path and its O(n) expiry scan.
//!
//! Expiry instants saturate: a TTL too large to add to the current instant
//! stores the entry until [`FAR_FUTURE`] from now.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::backend::{Generation, LlmBackend, SharedBackend};
use crate::error::BackendError;
use crate::metrics::GatewayMetrics;

/// Default time-to-live: 24 hours
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default capacity in entries
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Lifetime used when `now + ttl` does not fit in an `Instant` (about 30 years)
pub const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

// ============================================================================
// Configuration
// ============================================================================

/// Response cache configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether the caching layer is installed at all
    pub enabled: bool,
    /// How long an entry stays valid
    pub ttl: Duration,
    /// Maximum number of entries
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_CACHE_TTL,
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

impl CacheConfig {
    /// Set time-to-live
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set capacity
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Enable or disable the layer
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// Cache Store
// ============================================================================

#[derive(Clone, Debug)]
struct CacheEntry {
    response: Generation,
    expires_at: Instant,
    /// Insertion order, breaks ties between equal expirations
    sequence: u64,
}

/// Cache statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live and not-yet-pruned entries
    pub entries: usize,
    /// Lookups that returned a response
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because they were read after expiring
    pub expirations: u64,
}

/// Shared response store
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    /// Slots taken, never above `max_size`
    occupied: AtomicUsize,
    /// Serializes evict-then-insert on a full cache
    evict_lock: Mutex<()>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            occupied: AtomicUsize::new(0),
            evict_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Trim and collapse whitespace runs to single spaces
    #[must_use]
    pub fn normalize_prompt(prompt: &str) -> String {
        prompt.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Content hash of backend name and normalized prompt
    #[must_use]
    pub fn key_for(backend: &str, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(backend.as_bytes());
        hasher.update([0u8]);
        hasher.update(Self::normalize_prompt(prompt).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a live entry, removing it if it has expired
    pub fn get(&self, key: &str) -> Option<Generation> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired
            && self
                .entries
                .remove_if(key, |_, entry| entry.expires_at <= now)
                .is_some()
        {
            self.release_slot();
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response for the configured TTL
    pub fn put(&self, key: String, response: Generation) {
        self.put_with_ttl(key, response, self.config.ttl);
    }

    /// Store a response for a specific TTL
    pub fn put_with_ttl(&self, key: String, response: Generation, ttl: Duration) {
        if self.config.max_size == 0 {
            return;
        }
        let now = Instant::now();
        let entry = CacheEntry {
            response,
            expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        let Err((key, entry)) = self.try_insert(key, entry) else {
            return;
        };

        let _guard = self.evict_lock.lock();
        let (mut key, mut entry) = (key, entry);
        loop {
            match self.try_insert(key, entry) {
                Ok(()) => return,
                Err(rejected) => (key, entry) = rejected,
            }
            if self.evict_soonest_expiring().is_none() {
                tracing::debug!(key = %key, "Cache full with nothing to evict, dropping write");
                return;
            }
        }
    }

    /// Overwrite in place, or insert if a slot is free
    ///
    /// Holds only the key's shard lock. Hands the pair back when full.
    fn try_insert(&self, key: String, entry: CacheEntry) -> Result<(), (String, CacheEntry)> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if self.reserve_slot() {
                    vacant.insert(entry);
                    Ok(())
                } else {
                    Err((vacant.into_key(), entry))
                }
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        let max_size = self.config.max_size;
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_size).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.occupied.fetch_sub(1, Ordering::AcqRel);
    }

    fn evict_soonest_expiring(&self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| (entry.expires_at, entry.sequence))
            .map(|entry| entry.key().clone())?;

        self.entries.remove(&victim)?;
        self.release_slot();
        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %victim, "Evicted cache entry with soonest expiration");
        Some(victim)
    }

    /// Remove one entry
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.release_slot();
        }
        removed
    }

    /// Remove everything
    pub fn clear(&self) {
        self.entries.retain(|_, _| {
            self.release_slot();
            false
        });
    }

    /// Number of stored entries (including expired ones not yet read)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a key is stored, without expiring it
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

// ============================================================================
// Caching Decorator
// ============================================================================

/// Serves repeated prompts from a [`ResponseCache`]
pub struct CachingBackend {
    inner: SharedBackend,
    cache: Arc<ResponseCache>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl CachingBackend {
    /// Wrap a backend with a shared cache
    pub fn new(inner: SharedBackend, cache: Arc<ResponseCache>) -> Self {
        Self {
            inner,
            cache,
            metrics: None,
        }
    }

    /// Report hits and misses to a metrics registry
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl LlmBackend for CachingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError> {
        let key = ResponseCache::key_for(self.name(), prompt);

        if let Some(mut hit) = self.cache.get(&key) {
            tracing::debug!(backend = %self.name(), "Serving response from cache");
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_hit(self.name());
            }
            hit.cached = true;
            return Ok(hit);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss(self.name());
        }

        let response = self.inner.generate(prompt).await?;
        self.cache.put(key, response.clone());
        Ok(response)
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }
}
