//! Shared helpers for gateway integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use gateway_core::{
    BackendError, EvaluationResult, Evaluator, Generation, LlmBackend, OptimizedPrompt, Optimizer,
    SharedBackend, HEALTH_CHECK_PROMPT,
};

// =============================================================================
// Mock Backend
// =============================================================================

/// Backend answering from a queue, then from a fixed default
pub struct MockBackend {
    name: String,
    default: Result<String, BackendError>,
    queued: Mutex<VecDeque<Result<String, BackendError>>>,
    prompts: Mutex<Vec<String>>,
    healthy: AtomicBool,
}

impl MockBackend {
    pub fn answering(name: &str, content: &str) -> Arc<Self> {
        Arc::new(Self::new(name, Ok(content.to_string())))
    }

    pub fn failing(name: &str, error: BackendError) -> Arc<Self> {
        Arc::new(Self::new(name, Err(error)))
    }

    fn new(name: &str, default: Result<String, BackendError>) -> Self {
        Self {
            name: name.to_string(),
            default,
            queued: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn push(&self, outcome: Result<String, BackendError>) {
        self.queued.lock().push_back(outcome);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Prompts received outside of health probes
    pub fn generation_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .iter()
            .filter(|p| p.as_str() != HEALTH_CHECK_PROMPT)
            .cloned()
            .collect()
    }

    pub fn generation_count(&self) -> usize {
        self.generation_prompts().len()
    }

    pub fn shared(self: &Arc<Self>) -> SharedBackend {
        Arc::clone(self) as SharedBackend
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, BackendError> {
        self.prompts.lock().push(prompt.to_string());
        let outcome = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        outcome.map(|content| Generation::new(self.name.clone(), content))
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Mock Evaluator / Optimizer
// =============================================================================

/// Evaluator returning queued verdicts, then accepting
#[derive(Default)]
pub struct QueuedEvaluator {
    verdicts: Mutex<VecDeque<EvaluationResult>>,
    seen: Mutex<Vec<String>>,
}

impl QueuedEvaluator {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(verdicts: impl IntoIterator<Item = EvaluationResult>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn responses_seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Evaluator for QueuedEvaluator {
    async fn evaluate(
        &self,
        _prompt: &str,
        response: &str,
        _goal: &str,
        _context: &str,
    ) -> anyhow::Result<EvaluationResult> {
        self.seen.lock().push(response.to_string());
        Ok(self
            .verdicts
            .lock()
            .pop_front()
            .unwrap_or_else(|| EvaluationResult::acceptable(0.9, "fine")))
    }
}

/// Optimizer that returns the prompt unchanged, or always fails
pub struct FixedOptimizer {
    fail: bool,
}

impl FixedOptimizer {
    pub fn passthrough() -> Arc<Self> {
        Arc::new(Self { fail: false })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self { fail: true })
    }
}

#[async_trait]
impl Optimizer for FixedOptimizer {
    async fn optimize(
        &self,
        prompt: &str,
        _goal: &str,
        _context: &str,
        _backend: &str,
    ) -> anyhow::Result<OptimizedPrompt> {
        if self.fail {
            return Err(anyhow!("optimizer unavailable"));
        }
        Ok(OptimizedPrompt::new(prompt))
    }
}
