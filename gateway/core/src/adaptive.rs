//! Adaptive Evaluation Loop
//!
//! Wraps the router with a judge: every answer is evaluated, and the loop
//! decides whether to accept it, regenerate with feedback, or move to a
//! different backend.
//!
//! # State Machine
//!
//! ```text
//! Init -> Optimizing -> Generating -> Evaluating -+-> Accepted
//!                           ^                     |
//!                           |                     +-> RetryingWithFeedback --+
//!                           |                     |                          |
//!                           |                     +-> RetryingWithFallback --+
//!                           |                     |                          |
//!                           +---------------------)--------------------------+
//!                                                 +-> Exhausted
//!                                                 +-> Failed
//! ```
//!
//! Each retry state is entered at most once per request:
//!
//! - **RetryingWithFeedback**: the answer scored below the threshold (or the
//!   evaluator itself failed). Regenerate with the evaluator's feedback
//!   appended, same backend set.
//! - **RetryingWithFallback**: the evaluator flagged a critical error. The
//!   producing backend is dropped and the prompt is retried with feedback on
//!   the remaining ones.
//! - **Exhausted**: still below threshold after the feedback retry; the last
//!   answer is returned with `accepted = false`.
//!
//! Whatever the outcome, a JSON [`OutputRecord`] is written to key-value
//! memory. Memory failures are logged and never fail the request.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthMonitor;
use crate::memory::KeyValueMemory;
use crate::router::{BackendRouter, RouteOptions, RoutedResponse};

// ============================================================================
// Collaborator Interfaces
// ============================================================================

/// Verdict on one answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Quality in `[0, 1]`
    pub score: f64,
    /// Whether the evaluator considers the answer good enough
    pub is_acceptable: bool,
    /// The answer is broken (refusal, error text, wrong format)
    pub is_error: bool,
    /// What to fix
    pub feedback: String,
    /// Concrete suggestions
    pub improvements: Vec<String>,
}

impl EvaluationResult {
    /// Verdict derived from a score and threshold
    pub fn from_score(score: f64, threshold: f64, feedback: impl Into<String>) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            score,
            is_acceptable: score >= threshold,
            is_error: false,
            feedback: feedback.into(),
            improvements: Vec::new(),
        }
    }

    /// An accepted answer
    pub fn acceptable(score: f64, feedback: impl Into<String>) -> Self {
        Self {
            is_acceptable: true,
            ..Self::from_score(score, 0.0, feedback)
        }
    }

    /// A rejected answer
    pub fn rejected(score: f64, feedback: impl Into<String>) -> Self {
        Self {
            is_acceptable: false,
            ..Self::from_score(score, 1.0, feedback)
        }
    }

    /// A critically broken answer
    pub fn critical(feedback: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            is_acceptable: false,
            is_error: true,
            feedback: feedback.into(),
            improvements: Vec::new(),
        }
    }

    /// Attach suggestions
    #[must_use]
    pub fn with_improvements<I, S>(mut self, improvements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.improvements = improvements.into_iter().map(Into::into).collect();
        self
    }

    /// Acceptable, not an error, and at or above `threshold`
    #[must_use]
    pub fn meets(&self, threshold: f64) -> bool {
        !self.is_error && self.is_acceptable && self.score >= threshold
    }
}

/// Prompt produced by an optimizer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedPrompt {
    /// Rewritten prompt
    pub prompt: String,
    /// Optimizer notes
    pub suggestions: Vec<String>,
}

impl OptimizedPrompt {
    /// Wrap a rewritten prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            suggestions: Vec::new(),
        }
    }
}

/// Judges answers against a goal
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate `response` to `prompt`
    async fn evaluate(
        &self,
        prompt: &str,
        response: &str,
        goal: &str,
        context: &str,
    ) -> anyhow::Result<EvaluationResult>;
}

/// Rewrites prompts for a goal and target backend
#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Rewrite `prompt` for `backend`
    async fn optimize(
        &self,
        prompt: &str,
        goal: &str,
        context: &str,
        backend: &str,
    ) -> anyhow::Result<OptimizedPrompt>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Adaptive loop configuration
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationConfig {
    /// Minimum score for acceptance
    pub acceptable_score_threshold: f64,

    /// Prefix for memory keys (`<prefix>:<request id>`)
    pub memory_key_prefix: String,

    /// Use best-of selection unless the request says otherwise
    pub best_of_by_default: bool,

    /// Fail the request when optimization fails on every attempt
    pub strict_optimization: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            acceptable_score_threshold: 0.7,
            memory_key_prefix: "gateway:output".to_string(),
            best_of_by_default: false,
            strict_optimization: false,
        }
    }
}

impl EvaluationConfig {
    /// Set the acceptance threshold
    #[must_use]
    pub fn with_acceptable_score_threshold(mut self, threshold: f64) -> Self {
        self.acceptable_score_threshold = threshold;
        self
    }

    /// Set the memory key prefix
    #[must_use]
    pub fn with_memory_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.memory_key_prefix = prefix.into();
        self
    }

    /// Default to best-of selection
    #[must_use]
    pub fn with_best_of_by_default(mut self, best_of: bool) -> Self {
        self.best_of_by_default = best_of;
        self
    }

    /// Surface optimizer failures instead of using the original prompt
    #[must_use]
    pub fn with_strict_optimization(mut self, strict: bool) -> Self {
        self.strict_optimization = strict;
        self
    }
}

// ============================================================================
// Requests, States, Outcomes
// ============================================================================

/// One request to the adaptive loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdaptiveRequest {
    /// What to ask
    pub prompt: String,
    /// What a good answer achieves
    pub goal: String,
    /// Extra material appended to the prompt
    pub context: Option<String>,
    /// Force best-of (`Some(true)`) or first-success (`Some(false)`) routing
    pub best_of: Option<bool>,
}

impl AdaptiveRequest {
    /// Request with a prompt and goal
    pub fn new(prompt: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            goal: goal.into(),
            context: None,
            best_of: None,
        }
    }

    /// Attach context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Choose routing mode
    #[must_use]
    pub fn with_best_of(mut self, best_of: bool) -> Self {
        self.best_of = Some(best_of);
        self
    }

    fn context_str(&self) -> &str {
        self.context.as_deref().unwrap_or("")
    }

    /// Prompt with context appended
    #[must_use]
    pub fn base_prompt(&self) -> String {
        match self.context.as_deref().map(str::trim) {
            Some(context) if !context.is_empty() => {
                format!("{}\n\nContext:\n{context}", self.prompt)
            }
            _ => self.prompt.clone(),
        }
    }
}

/// Loop states, recorded in order in [`AdaptiveOutcome::trace`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Request received
    Init,
    /// Rewriting the prompt
    Optimizing,
    /// Waiting on the router
    Generating,
    /// Waiting on the evaluator
    Evaluating,
    /// Answer accepted
    Accepted,
    /// Regenerating with feedback
    RetryingWithFeedback,
    /// Regenerating without the backend that produced a critical error
    RetryingWithFallback,
    /// Retries spent; last answer returned unaccepted
    Exhausted,
    /// Request failed
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::Optimizing => "optimizing",
            Self::Generating => "generating",
            Self::Evaluating => "evaluating",
            Self::Accepted => "accepted",
            Self::RetryingWithFeedback => "retrying_with_feedback",
            Self::RetryingWithFallback => "retrying_with_fallback",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Result of a completed loop
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptiveOutcome {
    /// Request identifier (also the memory key suffix)
    pub request_id: Uuid,
    /// Final answer
    pub response: RoutedResponse,
    /// Verdict on the final answer
    pub evaluation: EvaluationResult,
    /// Whether the final answer met the threshold
    pub accepted: bool,
    /// Router calls made
    pub attempts: u32,
    /// States visited, in order
    pub trace: Vec<LoopState>,
    /// Prompt that produced the final answer
    pub final_prompt: String,
    /// Where the output record was written
    pub memory_key: String,
}

/// JSON record written to memory for every request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Request identifier
    pub request_id: Uuid,
    /// Request goal
    pub goal: String,
    /// Last prompt sent to the router
    pub prompt: String,
    /// Final answer, if any
    pub output: Option<String>,
    /// Backend of the final answer
    pub backend: Option<String>,
    /// Evaluator score of the final answer
    pub score: Option<f64>,
    /// Whether the answer was accepted
    pub accepted: bool,
    /// Failure description, if the request failed
    pub error: Option<String>,
    /// Router calls made
    pub attempts: u32,
    /// States visited
    pub trace: Vec<LoopState>,
    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Progress {
    trace: Vec<LoopState>,
    attempts: u32,
    prompt: String,
    last: Option<(RoutedResponse, EvaluationResult)>,
}

impl Progress {
    fn enter(&mut self, state: LoopState) {
        tracing::debug!(state = %state, "Adaptive loop transition");
        self.trace.push(state);
    }
}

struct Verdict {
    response: RoutedResponse,
    evaluation: EvaluationResult,
    accepted: bool,
}

fn with_feedback(prompt: &str, evaluation: &EvaluationResult) -> String {
    let mut next = format!(
        "{prompt}\n\nFeedback on the previous answer: {}",
        evaluation.feedback
    );
    if !evaluation.improvements.is_empty() {
        next.push_str("\nSuggested improvements:");
        for improvement in &evaluation.improvements {
            next.push_str("\n- ");
            next.push_str(improvement);
        }
    }
    next
}

// ============================================================================
// Adaptive Loop
// ============================================================================

/// Evaluate/retry loop over a [`BackendRouter`]
pub struct AdaptiveLoop {
    router: Arc<BackendRouter>,
    health: Arc<HealthMonitor>,
    evaluator: Arc<dyn Evaluator>,
    optimizer: Arc<dyn Optimizer>,
    memory: Arc<dyn KeyValueMemory>,
    config: EvaluationConfig,
}

impl AdaptiveLoop {
    /// Assemble a loop from its collaborators
    #[must_use]
    pub fn new(
        router: Arc<BackendRouter>,
        health: Arc<HealthMonitor>,
        evaluator: Arc<dyn Evaluator>,
        optimizer: Arc<dyn Optimizer>,
        memory: Arc<dyn KeyValueMemory>,
    ) -> Self {
        Self {
            router,
            health,
            evaluator,
            optimizer,
            memory,
            config: EvaluationConfig::default(),
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: EvaluationConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Run one request through the loop
    ///
    /// # Errors
    ///
    /// - `GatewayError::NoHealthyBackends` when every probe fails
    /// - `GatewayError::AllBackendsFailed` when the router finds no answer
    /// - `GatewayError::EvaluationFailed` when the evaluator keeps failing or
    ///   flags a critical error with no backend left to fall back to
    /// - `GatewayError::OptimizationFailed` in strict optimization mode
    pub async fn run(&self, request: &AdaptiveRequest) -> GatewayResult<AdaptiveOutcome> {
        let request_id = Uuid::new_v4();
        let memory_key = format!("{}:{request_id}", self.config.memory_key_prefix);
        tracing::info!(request_id = %request_id, goal = %request.goal, "Adaptive request started");

        let mut progress = Progress::default();
        progress.enter(LoopState::Init);
        let result = self.drive(request, &mut progress).await;

        if let Err(error) = &result {
            progress.enter(LoopState::Failed);
            tracing::warn!(request_id = %request_id, error = %error, "Adaptive request failed");
        }
        self.persist(&memory_key, request_id, request, &progress, &result)
            .await;

        let verdict = result?;
        tracing::info!(
            request_id = %request_id,
            backend = %verdict.response.backend,
            score = verdict.evaluation.score,
            accepted = verdict.accepted,
            attempts = progress.attempts,
            "Adaptive request finished"
        );
        Ok(AdaptiveOutcome {
            request_id,
            response: verdict.response,
            evaluation: verdict.evaluation,
            accepted: verdict.accepted,
            attempts: progress.attempts,
            trace: progress.trace,
            final_prompt: progress.prompt,
            memory_key,
        })
    }

    async fn healthy_set(&self) -> Vec<String> {
        let results = self.health.check_all_providers().await;
        self.router
            .order_by_preference()
            .into_iter()
            .filter(|name| results.get(name).is_some_and(|r| r.is_healthy()))
            .collect()
    }

    async fn optimize(
        &self,
        request: &AdaptiveRequest,
        base_prompt: &str,
        healthy: &mut Vec<String>,
    ) -> GatewayResult<String> {
        let mut last_error = String::new();

        for attempt in 0..2 {
            let Some(selected) = healthy.first().cloned() else {
                break;
            };
            match self
                .optimizer
                .optimize(base_prompt, &request.goal, request.context_str(), &selected)
                .await
            {
                Ok(optimized) if !optimized.prompt.trim().is_empty() => {
                    return Ok(optimized.prompt);
                }
                Ok(_) => {
                    tracing::debug!(backend = %selected, "Optimizer returned an empty prompt");
                    return Ok(base_prompt.to_string());
                }
                Err(error) => {
                    tracing::warn!(
                        backend = %selected,
                        attempt = attempt + 1,
                        error = %error,
                        "Prompt optimization failed"
                    );
                    last_error = error.to_string();
                    if healthy.len() > 1 {
                        healthy.retain(|name| name != &selected);
                    } else {
                        break;
                    }
                }
            }
        }

        if self.config.strict_optimization {
            return Err(GatewayError::OptimizationFailed(last_error));
        }
        Ok(base_prompt.to_string())
    }

    async fn drive(
        &self,
        request: &AdaptiveRequest,
        progress: &mut Progress,
    ) -> GatewayResult<Verdict> {
        let mut healthy = self.healthy_set().await;
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyBackends);
        }

        progress.enter(LoopState::Optimizing);
        let base_prompt = request.base_prompt();
        let prompt = self.optimize(request, &base_prompt, &mut healthy).await?;
        progress.prompt.clone_from(&prompt);

        let best_of = request.best_of.unwrap_or(self.config.best_of_by_default);
        let threshold = self.config.acceptable_score_threshold;
        let mut feedback_retry_used = false;
        let mut fallback_retry_used = false;

        loop {
            progress.enter(LoopState::Generating);
            progress.attempts += 1;
            let options = RouteOptions::restricted_to(healthy.iter().cloned());
            let response = if best_of {
                self.router
                    .generate_best_with(&progress.prompt, &options)
                    .await?
            } else {
                self.router.generate_with(&progress.prompt, &options).await?
            };

            progress.enter(LoopState::Evaluating);
            let evaluation = match self
                .evaluator
                .evaluate(
                    &progress.prompt,
                    &response.generation.content,
                    &request.goal,
                    request.context_str(),
                )
                .await
            {
                Ok(evaluation) => evaluation,
                Err(error) => {
                    tracing::warn!(backend = %response.backend, error = %error, "Evaluation failed");
                    if feedback_retry_used {
                        return Err(GatewayError::EvaluationFailed {
                            backend: Some(response.backend),
                            reason: error.to_string(),
                        });
                    }
                    feedback_retry_used = true;
                    progress.enter(LoopState::RetryingWithFeedback);
                    continue;
                }
            };
            progress.last = Some((response.clone(), evaluation.clone()));

            if evaluation.is_error {
                healthy.retain(|name| name != &response.backend);
                if fallback_retry_used || healthy.is_empty() {
                    return Err(GatewayError::EvaluationFailed {
                        backend: Some(response.backend),
                        reason: evaluation.feedback,
                    });
                }
                fallback_retry_used = true;
                tracing::info!(
                    backend = %response.backend,
                    remaining = healthy.len(),
                    "Critical evaluation, retrying without backend"
                );
                progress.enter(LoopState::RetryingWithFallback);
                progress.prompt = with_feedback(&prompt, &evaluation);
                continue;
            }

            if evaluation.meets(threshold) {
                progress.enter(LoopState::Accepted);
                return Ok(Verdict {
                    response,
                    evaluation,
                    accepted: true,
                });
            }

            if feedback_retry_used {
                progress.enter(LoopState::Exhausted);
                return Ok(Verdict {
                    response,
                    evaluation,
                    accepted: false,
                });
            }
            feedback_retry_used = true;
            tracing::info!(
                backend = %response.backend,
                score = evaluation.score,
                threshold,
                "Answer below threshold, retrying with feedback"
            );
            progress.enter(LoopState::RetryingWithFeedback);
            progress.prompt = with_feedback(&prompt, &evaluation);
        }
    }

    async fn persist(
        &self,
        key: &str,
        request_id: Uuid,
        request: &AdaptiveRequest,
        progress: &Progress,
        result: &GatewayResult<Verdict>,
    ) {
        let (output, backend, score) = match (result, &progress.last) {
            (Ok(verdict), _) => (
                Some(verdict.response.generation.content.clone()),
                Some(verdict.response.backend.clone()),
                Some(verdict.evaluation.score),
            ),
            (Err(_), Some((response, evaluation))) => (
                Some(response.generation.content.clone()),
                Some(response.backend.clone()),
                Some(evaluation.score),
            ),
            (Err(_), None) => (None, None, None),
        };

        let record = OutputRecord {
            request_id,
            goal: request.goal.clone(),
            prompt: progress.prompt.clone(),
            output,
            backend,
            score,
            accepted: result.as_ref().is_ok_and(|v| v.accepted),
            error: result.as_ref().err().map(ToString::to_string),
            attempts: progress.attempts,
            trace: progress.trace.clone(),
            recorded_at: Utc::now(),
        };

        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Could not serialize output record");
                return;
            }
        };
        if let Err(error) = self.memory.save(key, &value).await {
            tracing::warn!(key = %key, error = %error, "Could not persist output record");
        }
    }
}

impl fmt::Debug for AdaptiveLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveLoop")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmBackend;
    use crate::error::BackendError;
    use crate::health::{HealthCheckCache, HealthConfig};
    use crate::memory::InMemoryStore;
    use crate::router::{Preference, RouterConfig};
    use crate::test_utils::{RecordingMemory, ScriptedBackend, ScriptedEvaluator, ScriptedOptimizer};
    use pretty_assertions::assert_eq;

    struct Harness {
        router: Arc<BackendRouter>,
        health: Arc<HealthMonitor>,
    }

    fn harness(backends: &[Arc<ScriptedBackend>]) -> Harness {
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            Arc::new(HealthCheckCache::default()),
        ));
        let names: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();
        let mut router = BackendRouter::new(
            RouterConfig::default().with_preference(Preference::ordered(names)),
            Arc::clone(&health),
        );
        for backend in backends {
            health.register(backend.clone()).expect("health register");
            router.register(backend.clone()).expect("router register");
        }
        Harness {
            router: Arc::new(router),
            health,
        }
    }

    fn adaptive(
        harness: &Harness,
        evaluator: Arc<ScriptedEvaluator>,
        optimizer: Arc<ScriptedOptimizer>,
        memory: Arc<dyn KeyValueMemory>,
    ) -> AdaptiveLoop {
        AdaptiveLoop::new(
            Arc::clone(&harness.router),
            Arc::clone(&harness.health),
            evaluator,
            optimizer,
            memory,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepts_first_good_answer() {
        let a = Arc::new(ScriptedBackend::always("a", "answer"));
        let h = harness(&[a.clone()]);
        let memory = Arc::new(InMemoryStore::new());
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            Arc::new(ScriptedOptimizer::passthrough()),
            memory.clone(),
        );

        let outcome = lp
            .run(&AdaptiveRequest::new("What is Rust?", "explain"))
            .await
            .expect("accepted");

        assert!(outcome.accepted);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.trace,
            vec![
                LoopState::Init,
                LoopState::Optimizing,
                LoopState::Generating,
                LoopState::Evaluating,
                LoopState::Accepted,
            ]
        );
        assert_eq!(a.generation_prompts(), vec!["What is Rust?"]);

        let stored = memory
            .retrieve(&outcome.memory_key)
            .await
            .expect("retrieve")
            .expect("record written");
        let record: OutputRecord = serde_json::from_str(&stored).expect("json");
        assert_eq!(record.output.as_deref(), Some("answer"));
        assert_eq!(record.goal, "explain");
        assert!(record.accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_retries_once_with_feedback() {
        let a = Arc::new(ScriptedBackend::always("a", "answer"));
        let h = harness(&[a.clone()]);
        let evaluator = Arc::new(
            ScriptedEvaluator::accepting()
                .then(EvaluationResult::rejected(0.4, "add more detail"))
                .then(EvaluationResult::acceptable(0.9, "good")),
        );
        let lp = adaptive(
            &h,
            evaluator.clone(),
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp
            .run(&AdaptiveRequest::new("Describe ownership", "teach"))
            .await
            .expect("accepted on retry");

        let prompts = a.generation_prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Describe ownership"));
        assert!(prompts[1].contains("add more detail"));
        assert!(outcome.accepted);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.trace.contains(&LoopState::RetryingWithFeedback));
        assert_eq!(evaluator.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rejection_returns_unaccepted_answer() {
        let a = Arc::new(ScriptedBackend::always("a", "meh"));
        let h = harness(&[a.clone()]);
        let evaluator = Arc::new(
            ScriptedEvaluator::accepting()
                .then(EvaluationResult::rejected(0.3, "too short"))
                .then(
                    EvaluationResult::rejected(0.5, "still short")
                        .with_improvements(["add an example"]),
                ),
        );
        let lp = adaptive(
            &h,
            evaluator,
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp.run(&AdaptiveRequest::new("q", "g")).await.expect("answer");

        assert!(!outcome.accepted);
        assert_eq!(outcome.trace.last(), Some(&LoopState::Exhausted));
        assert_eq!(a.generation_count(), 2);
        assert_eq!(outcome.evaluation.feedback, "still short");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptable_flag_below_threshold_is_rejected() {
        let a = Arc::new(ScriptedBackend::always("a", "meh"));
        let h = harness(&[a.clone()]);
        let evaluator = Arc::new(
            ScriptedEvaluator::accepting().then(EvaluationResult::acceptable(0.5, "fine?")),
        );
        let lp = adaptive(
            &h,
            evaluator,
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp.run(&AdaptiveRequest::new("q", "g")).await.expect("answer");

        assert!(outcome.accepted);
        assert_eq!(a.generation_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_error_falls_back_to_other_backend() {
        let a = Arc::new(ScriptedBackend::always("a", "broken"));
        let b = Arc::new(ScriptedBackend::always("b", "solid"));
        let h = harness(&[a.clone(), b.clone()]);
        let evaluator = Arc::new(
            ScriptedEvaluator::accepting()
                .then(EvaluationResult::critical("refused to answer"))
                .then(EvaluationResult::acceptable(0.95, "great")),
        );
        let lp = adaptive(
            &h,
            evaluator,
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp.run(&AdaptiveRequest::new("q", "g")).await.expect("fell back");

        assert_eq!(outcome.response.backend, "b");
        assert!(outcome.trace.contains(&LoopState::RetryingWithFallback));
        assert_eq!(a.generation_count(), 1);
        let b_prompts = b.generation_prompts();
        assert_eq!(b_prompts.len(), 1);
        assert!(b_prompts[0].contains("refused to answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_error_without_alternatives_fails() {
        let a = Arc::new(ScriptedBackend::always("a", "broken"));
        let h = harness(&[a]);
        let memory = Arc::new(InMemoryStore::new());
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting().then(EvaluationResult::critical("garbage"))),
            Arc::new(ScriptedOptimizer::passthrough()),
            memory.clone(),
        );

        let err = lp.run(&AdaptiveRequest::new("q", "g")).await.expect_err("failed");

        assert_eq!(
            err,
            GatewayError::EvaluationFailed {
                backend: Some("a".into()),
                reason: "garbage".into(),
            }
        );
        assert_eq!(memory.len(), 1, "failures are persisted too");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_healthy_backends() {
        let a = Arc::new(ScriptedBackend::failing(
            "a",
            BackendError::ConnectionFailed("refused".into()),
        ));
        let h = harness(&[a]);
        let memory = Arc::new(InMemoryStore::new());
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            Arc::new(ScriptedOptimizer::passthrough()),
            memory.clone(),
        );

        let err = lp.run(&AdaptiveRequest::new("q", "g")).await.expect_err("none");

        assert_eq!(err, GatewayError::NoHealthyBackends);
        let key = memory.keys_with_prefix("gateway:output:").pop().expect("persisted");
        let stored = memory.retrieve(&key).await.expect("retrieve").expect("value");
        let record: OutputRecord = serde_json::from_str(&stored).expect("json");
        assert_eq!(record.trace, vec![LoopState::Init, LoopState::Failed]);
        assert!(record.output.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimizer_failure_moves_to_next_backend() {
        let a = Arc::new(ScriptedBackend::always("a", "from a"));
        let b = Arc::new(ScriptedBackend::always("b", "from b"));
        let h = harness(&[a.clone(), b.clone()]);
        let optimizer = Arc::new(
            ScriptedOptimizer::passthrough()
                .then_fail("optimizer down")
                .then("optimized prompt"),
        );
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            optimizer.clone(),
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp.run(&AdaptiveRequest::new("raw", "g")).await.expect("ok");

        assert_eq!(optimizer.backends_used(), vec!["a", "b"]);
        assert_eq!(outcome.response.backend, "b");
        assert_eq!(b.generation_prompts(), vec!["optimized prompt"]);
        assert_eq!(a.generation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimizer_failing_twice_uses_original_prompt() {
        let a = Arc::new(ScriptedBackend::always("a", "from a"));
        let b = Arc::new(ScriptedBackend::always("b", "from b"));
        let h = harness(&[a, b.clone()]);
        let optimizer = Arc::new(
            ScriptedOptimizer::passthrough()
                .then_fail("first")
                .then_fail("second"),
        );
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            optimizer,
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp
            .run(&AdaptiveRequest::new("raw", "g").with_context("ctx"))
            .await
            .expect("ok");

        assert_eq!(outcome.final_prompt, "raw\n\nContext:\nctx");
        assert_eq!(b.generation_prompts(), vec!["raw\n\nContext:\nctx"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_optimization_surfaces_failure() {
        let a = Arc::new(ScriptedBackend::always("a", "x"));
        let h = harness(&[a]);
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            Arc::new(ScriptedOptimizer::passthrough().then_fail("no model")),
            Arc::new(InMemoryStore::new()),
        )
        .with_config(EvaluationConfig::default().with_strict_optimization(true));

        let err = lp.run(&AdaptiveRequest::new("q", "g")).await.expect_err("strict");
        assert_eq!(err, GatewayError::OptimizationFailed("no model".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluator_failing_twice_is_surfaced() {
        let a = Arc::new(ScriptedBackend::always("a", "x"));
        let h = harness(&[a.clone()]);
        let lp = adaptive(
            &h,
            Arc::new(
                ScriptedEvaluator::accepting()
                    .then_fail("judge offline")
                    .then_fail("judge still offline"),
            ),
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(InMemoryStore::new()),
        );

        let err = lp.run(&AdaptiveRequest::new("q", "g")).await.expect_err("failed");

        assert!(matches!(
            err,
            GatewayError::EvaluationFailed { ref reason, .. } if reason == "judge still offline"
        ));
        assert_eq!(a.generation_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_failure_does_not_fail_request() {
        let a = Arc::new(ScriptedBackend::always("a", "x"));
        let h = harness(&[a]);
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(RecordingMemory::refusing()),
        );

        let outcome = lp.run(&AdaptiveRequest::new("q", "g")).await.expect("ok");
        assert!(outcome.accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_of_routing_scores_candidates() {
        let a = Arc::new(ScriptedBackend::always("a", "ok"));
        let b = Arc::new(ScriptedBackend::always(
            "b",
            "This is a good, detailed, helpful answer with an example.",
        ));
        let h = harness(&[a.clone(), b.clone()]);
        let lp = adaptive(
            &h,
            Arc::new(ScriptedEvaluator::accepting()),
            Arc::new(ScriptedOptimizer::passthrough()),
            Arc::new(InMemoryStore::new()),
        );

        let outcome = lp
            .run(&AdaptiveRequest::new("q", "g").with_best_of(true))
            .await
            .expect("ok");

        assert_eq!(outcome.response.backend, "b");
        assert!(outcome.response.score.is_some());
        assert_eq!(a.generation_count(), 1);
        assert_eq!(b.generation_count(), 1);
    }

    #[test]
    fn test_feedback_prompt_lists_improvements() {
        let evaluation = EvaluationResult::rejected(0.2, "too vague")
            .with_improvements(["cite sources", "add code"]);

        assert_eq!(
            with_feedback("base", &evaluation),
            "base\n\nFeedback on the previous answer: too vague\n\
             Suggested improvements:\n- cite sources\n- add code"
        );
    }
}
