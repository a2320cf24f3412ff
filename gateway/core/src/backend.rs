//! Backend Abstraction
//!
//! The one capability every text-generation backend offers the gateway:
//! turn a prompt into text, and say whether it is currently reachable.
//! Vendor adapters implement [`LlmBackend`] outside this crate; every
//! resilience decorator implements it too, so decorators and raw backends
//! nest freely.
//!
//! Backends are registered once and shared by handle ([`SharedBackend`]);
//! the router and the health monitor hold clones of the same `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Token accounting reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens produced in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Create from prompt and completion counts
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Prompt plus completion tokens
    #[must_use]
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A generated answer
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    /// The response text
    pub content: String,
    /// Name of the backend that produced it
    pub backend: String,
    /// Token usage, when the backend reports it
    pub token_usage: Option<TokenUsage>,
    /// Whether the answer was served from the response cache
    pub cached: bool,
}

impl Generation {
    /// Create a fresh (uncached) generation
    pub fn new(backend: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            backend: backend.into(),
            token_usage: None,
            cached: false,
        }
    }

    /// Attach token usage metadata
    #[must_use]
    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// Text-generation capability
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Unique backend name (identity for routing, health and caching)
    fn name(&self) -> &str;

    /// Generate a response for the prompt
    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError>;

    /// Live reachability probe
    async fn is_healthy(&self) -> bool;
}

/// Shared handle to a backend or a decorated backend
pub type SharedBackend = Arc<dyn LlmBackend>;
