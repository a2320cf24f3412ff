//! Key-Value Memory
//!
//! Narrow persistence interface the adaptive loop writes final outputs to.
//! Hosts plug in their own store; [`InMemoryStore`] covers tests and
//! single-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;

/// String key-value persistence
#[async_trait]
pub trait KeyValueMemory: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Fetch the value stored under `key`
    async fn retrieve(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Process-local memory backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, String>,
}

impl InMemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored keys with the given prefix, sorted
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueMemory for InMemoryStore {
    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }
}
