//! Gateway Test Utilities
//!
//! Scripted collaborators for unit tests: a backend whose outcomes are queued
//! up front and which records every prompt it receives, plus an evaluator,
//! optimizer and memory with the same flavor.
//!
//! # Usage
//!
//! ```ignore
//! let backend = ScriptedBackend::always("local", "fine answer")
//!     .queue_failure(BackendError::ConnectionFailed("refused".into()));
//!
//! // First call fails, every later call answers "fine answer"
//! assert_eq!(backend.generation_prompts(), vec!["..."]);
//! ```

#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::adaptive::{EvaluationResult, Evaluator, OptimizedPrompt, Optimizer};
use crate::backend::{Generation, LlmBackend, TokenUsage};
use crate::error::BackendError;
use crate::health::HEALTH_CHECK_PROMPT;
use crate::memory::KeyValueMemory;

// ============================================================================
// Scripted Backend
// ============================================================================

type Outcome = Result<String, BackendError>;

/// Backend that replays queued outcomes, then a default one
pub struct ScriptedBackend {
    name: String,
    default: Outcome,
    queued: Mutex<VecDeque<Outcome>>,
    prompts: Mutex<Vec<String>>,
    healthy: AtomicBool,
    delay: Option<Duration>,
    token_usage: Option<TokenUsage>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    fn with_default(name: &str, default: Outcome) -> Self {
        Self {
            name: name.to_string(),
            default,
            queued: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            delay: None,
            token_usage: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always answers `content`
    pub fn always(name: &str, content: &str) -> Self {
        Self::with_default(name, Ok(content.to_string()))
    }

    /// Always fails with `error`
    pub fn failing(name: &str, error: BackendError) -> Self {
        Self::with_default(name, Err(error))
    }

    /// Queue a one-off answer ahead of the default
    #[must_use]
    pub fn queue_response(self, content: &str) -> Self {
        self.queued.lock().push_back(Ok(content.to_string()));
        self
    }

    /// Queue a one-off failure ahead of the default
    #[must_use]
    pub fn queue_failure(self, error: BackendError) -> Self {
        self.queued.lock().push_back(Err(error));
        self
    }

    /// Delay every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report token usage on success
    #[must_use]
    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    /// Initial answer of `is_healthy`
    #[must_use]
    pub fn with_healthy(self, healthy: bool) -> Self {
        self.healthy.store(healthy, Ordering::SeqCst);
        self
    }

    /// Change the answer of `is_healthy`
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Every prompt received, probes included
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Prompts received, health probes excluded
    pub fn generation_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .iter()
            .filter(|p| p.as_str() != HEALTH_CHECK_PROMPT)
            .cloned()
            .collect()
    }

    /// Number of `generate` calls, probes included
    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Number of `generate` calls, probes excluded
    pub fn generation_count(&self) -> usize {
        self.generation_prompts().len()
    }

    /// Highest number of calls observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError> {
        self.prompts.lock().push(prompt.to_string());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        outcome.map(|content| {
            let generation = Generation::new(self.name.clone(), content);
            match self.token_usage {
                Some(usage) => generation.with_token_usage(usage),
                None => generation,
            }
        })
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Scripted Evaluator / Optimizer / Memory
// ============================================================================

/// Captured evaluator call
#[derive(Clone, Debug)]
pub struct EvaluationCall {
    /// Prompt that produced the response
    pub prompt: String,
    /// Response under evaluation
    pub response: String,
}

/// Evaluator replaying queued verdicts, then accepting everything
#[derive(Default)]
pub struct ScriptedEvaluator {
    queued: Mutex<VecDeque<anyhow::Result<EvaluationResult>>>,
    calls: Mutex<Vec<EvaluationCall>>,
}

impl ScriptedEvaluator {
    /// Accepts everything
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Queue a verdict
    #[must_use]
    pub fn then(self, verdict: EvaluationResult) -> Self {
        self.queued.lock().push_back(Ok(verdict));
        self
    }

    /// Queue an evaluator failure
    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.queued.lock().push_back(Err(anyhow!(message.to_string())));
        self
    }

    /// Calls received
    pub fn calls(&self) -> Vec<EvaluationCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        prompt: &str,
        response: &str,
        _goal: &str,
        _context: &str,
    ) -> anyhow::Result<EvaluationResult> {
        self.calls.lock().push(EvaluationCall {
            prompt: prompt.to_string(),
            response: response.to_string(),
        });
        self.queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(EvaluationResult::acceptable(0.9, "looks good")))
    }
}

/// Optimizer replaying queued outcomes, then passing prompts through
#[derive(Default)]
pub struct ScriptedOptimizer {
    queued: Mutex<VecDeque<anyhow::Result<String>>>,
    backends_used: Mutex<Vec<String>>,
}

impl ScriptedOptimizer {
    /// Returns prompts unchanged
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Queue a rewritten prompt
    #[must_use]
    pub fn then(self, prompt: &str) -> Self {
        self.queued.lock().push_back(Ok(prompt.to_string()));
        self
    }

    /// Queue an optimizer failure
    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.queued.lock().push_back(Err(anyhow!(message.to_string())));
        self
    }

    /// Backend passed on each call
    pub fn backends_used(&self) -> Vec<String> {
        self.backends_used.lock().clone()
    }
}

#[async_trait]
impl Optimizer for ScriptedOptimizer {
    async fn optimize(
        &self,
        prompt: &str,
        _goal: &str,
        _context: &str,
        backend: &str,
    ) -> anyhow::Result<OptimizedPrompt> {
        self.backends_used.lock().push(backend.to_string());
        let next = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(prompt.to_string()));
        next.map(OptimizedPrompt::new)
    }
}

/// Memory that records writes, optionally refusing them
#[derive(Default)]
pub struct RecordingMemory {
    entries: DashMap<String, String>,
    refuse_writes: bool,
}

impl RecordingMemory {
    /// Memory whose `save` always fails
    pub fn refusing() -> Self {
        Self {
            entries: DashMap::new(),
            refuse_writes: true,
        }
    }

    /// Stored (key, value) pairs
    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[async_trait]
impl KeyValueMemory for RecordingMemory {
    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()> {
        if self.refuse_writes {
            return Err(anyhow!("memory store unavailable"));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }
}
