//! Model gateway: the only way pipeline stages reach an LLM.
//!
//! A request names a capability and a safety tier, never a model. The gateway
//! asks the [`CapabilityMatrix`] for a [`FallbackPlan`] and walks it:
//!
//! - ineligible candidates are recorded as skipped
//! - transient failures (timeouts, 429, 5xx, schema mismatch) are retried
//!   against the same model with exponential backoff
//! - permanent failures and exhausted retries move on to the next candidate
//!
//! Every candidate touched ends up as an [`AttemptRecord`], so the manifest can
//! show exactly which models were tried and which one answered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cost::CostTracker;
use super::matrix::{
    CapabilityMatrix, CapabilityTier, FallbackPlan, FallbackStep, PlannedCandidate, SafetyTier,
};
use super::providers::build_provider;
use super::types::{GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use crate::error::{ErrorKind, LlmError};
use crate::metrics::MetricsCollector;
use crate::utils::json_extraction::extract_json_object;

/// Errors surfaced to callers of [`ModelGateway::complete`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("All candidates exhausted for capability '{capability}' ({} candidate(s) recorded)", attempts.len())]
    AllCandidatesExhausted {
        capability: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Gateway configuration error: {0}")]
    Config(String),

    #[error("Run budget exceeded: spent ${spent:.4} of ${budget:.4}")]
    BudgetExceeded {
        spent: f64,
        budget: f64,
        /// Candidates tried before the budget ran out.
        attempts: Vec<AttemptRecord>,
    },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::AllCandidatesExhausted { .. } => ErrorKind::AllCandidatesExhausted,
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
        }
    }

    /// Attempts made before the failure.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            GatewayError::AllCandidatesExhausted { attempts, .. } | GatewayError::BudgetExceeded { attempts, .. } => {
                attempts
            }
            GatewayError::Config(_) => &[],
        }
    }
}

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Tries per candidate, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Concurrent requests allowed per provider.
    pub max_in_flight_per_provider: usize,
    /// Upper bound for a single request.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Dollar budget for the run, `None` for unlimited.
    pub run_budget: Option<f64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_provider: 4,
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            run_budget: None,
        }
    }
}

/// Shape the reply must have before it is accepted.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResponseFormat {
    /// Any non-empty text.
    #[default]
    Text,
    /// A JSON object containing every listed key.
    JsonObject { required_keys: Vec<String> },
    /// A JSON object mapping every listed key to a number, or to an object
    /// with a numeric `score`.
    Scores { keys: Vec<String> },
}

/// A capability-addressed completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub capability: String,
    pub safety_tier: SafetyTier,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub response_format: ResponseFormat,
    pub allow_experimental: bool,
}

impl CompletionRequest {
    pub fn new(capability: impl Into<String>, safety_tier: SafetyTier, messages: Vec<Message>) -> Self {
        Self {
            capability: capability.into(),
            safety_tier,
            messages,
            temperature: None,
            max_tokens: None,
            response_format: ResponseFormat::Text,
            allow_experimental: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn allow_experimental(mut self, allow: bool) -> Self {
        self.allow_experimental = allow;
        self
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Skipped,
    PermanentFailure,
    RetriesExhausted,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::PermanentFailure => "permanent_failure",
            AttemptOutcome::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Record of one candidate the gateway considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model: String,
    pub provider: String,
    pub tier: CapabilityTier,
    pub step: FallbackStep,
    pub outcome: AttemptOutcome,
    /// Requests actually sent to the model.
    pub tries: u32,
    /// Skip reason or last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AttemptRecord {
    fn new(candidate: &PlannedCandidate, outcome: AttemptOutcome, tries: u32, detail: Option<String>) -> Self {
        Self {
            model: candidate.model.id.clone(),
            provider: candidate.model.provider.clone(),
            tier: candidate.model.tier,
            step: candidate.step,
            outcome,
            tries,
            detail,
        }
    }
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    /// Raw reply text.
    pub text: String,
    /// Parsed object for JSON formats.
    pub json: Option<Value>,
    pub model_used: String,
    pub provider: String,
    pub usage: Usage,
    /// Estimated dollar cost of the successful call.
    pub cost_estimate: f64,
    /// Every candidate considered, in order, ending with the one that answered.
    pub attempts: Vec<AttemptRecord>,
}

enum CandidateFailure {
    Permanent { error: LlmError, tries: u32 },
    Exhausted { error: LlmError, tries: u32 },
}

/// Capability-addressed access to LLM backends.
pub struct ModelGateway {
    matrix: Arc<CapabilityMatrix>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    limiters: HashMap<String, Arc<Semaphore>>,
    config: GatewayConfig,
    cost: Arc<CostTracker>,
    metrics: MetricsCollector,
}

impl ModelGateway {
    /// Creates a gateway with no backends registered.
    pub fn new(matrix: Arc<CapabilityMatrix>, config: GatewayConfig) -> Self {
        let cost = Arc::new(CostTracker::new(config.run_budget));
        Self {
            matrix,
            providers: HashMap::new(),
            limiters: HashMap::new(),
            config,
            cost,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a gateway with a backend for every provider the matrix declares.
    ///
    /// A provider whose API key is missing is left unregistered with a warning;
    /// pre-flight validation reports it if a plan depends on it.
    pub fn from_matrix(matrix: Arc<CapabilityMatrix>, config: GatewayConfig) -> Self {
        let mut gateway = Self::new(matrix.clone(), config);
        for provider_config in matrix.providers() {
            match build_provider(provider_config) {
                Ok(provider) => {
                    gateway = gateway.with_provider(provider_config.name.clone(), provider);
                }
                Err(e) => {
                    warn!(provider = %provider_config.name, error = %e, "Provider backend unavailable");
                }
            }
        }
        gateway
    }

    /// Registers (or replaces) the backend for `name`.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let name = name.into();
        let permits = self.config.max_in_flight_per_provider.max(1);
        self.limiters
            .insert(name.clone(), Arc::new(Semaphore::new(permits)));
        self.providers.insert(name, provider);
        self
    }

    pub fn matrix(&self) -> &CapabilityMatrix {
        &self.matrix
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost
    }

    /// Whether a backend is registered for `provider`.
    pub fn has_backend(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Resolves the fallback plan for a request.
    pub fn plan(
        &self,
        capability: &str,
        tier: SafetyTier,
        allow_experimental: bool,
    ) -> Result<FallbackPlan, GatewayError> {
        self.matrix
            .plan(capability, tier, allow_experimental)
            .map_err(|e| GatewayError::Config(e.to_string()))
    }

    fn check_budget(&self, attempts: &[AttemptRecord]) -> Result<(), GatewayError> {
        if self.cost.is_over_budget() {
            return Err(GatewayError::BudgetExceeded {
                spent: self.cost.total_spent(),
                budget: self.cost.budget().unwrap_or_default(),
                attempts: attempts.to_vec(),
            });
        }
        Ok(())
    }

    /// Serves `request` from the first candidate that produces a valid reply.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult, GatewayError> {
        self.check_budget(&[])?;
        let plan = self.plan(&request.capability, request.safety_tier, request.allow_experimental)?;

        let mut attempts = Vec::with_capacity(plan.candidates.len());

        for candidate in &plan.candidates {
            let model = &candidate.model;

            if let Some(reason) = candidate.skip {
                debug!(model = %model.id, reason = %reason, "Skipping candidate");
                self.metrics.record_gateway_attempt(&model.id, AttemptOutcome::Skipped.as_str());
                attempts.push(AttemptRecord::new(
                    candidate,
                    AttemptOutcome::Skipped,
                    0,
                    Some(reason.to_string()),
                ));
                continue;
            }

            let (Some(provider), Some(limiter)) = (
                self.providers.get(&model.provider),
                self.limiters.get(&model.provider),
            ) else {
                warn!(model = %model.id, provider = %model.provider, "No backend registered for provider");
                self.metrics
                    .record_gateway_attempt(&model.id, AttemptOutcome::PermanentFailure.as_str());
                attempts.push(AttemptRecord::new(
                    candidate,
                    AttemptOutcome::PermanentFailure,
                    0,
                    Some(format!("no backend registered for provider '{}'", model.provider)),
                ));
                continue;
            };

            self.check_budget(&attempts)?;

            match self.try_candidate(candidate, provider, limiter, request).await {
                Ok((response, json, tries)) => {
                    let usage = response.usage;
                    let cost_estimate = self.cost.record_usage(&model.id, &usage, &model.pricing);
                    self.metrics
                        .record_gateway_attempt(&model.id, AttemptOutcome::Succeeded.as_str());
                    attempts.push(AttemptRecord::new(candidate, AttemptOutcome::Succeeded, tries, None));

                    if candidate.step != FallbackStep::Primary {
                        info!(
                            capability = %request.capability,
                            model = %model.id,
                            step = ?candidate.step,
                            "Served by fallback candidate"
                        );
                    }

                    return Ok(CompletionResult {
                        text: response.first_content().unwrap_or_default().to_string(),
                        json,
                        model_used: model.id.clone(),
                        provider: model.provider.clone(),
                        usage,
                        cost_estimate,
                        attempts,
                    });
                }
                Err(CandidateFailure::Permanent { error, tries }) => {
                    warn!(model = %model.id, error = %error, "Permanent failure, moving to next candidate");
                    self.metrics
                        .record_gateway_attempt(&model.id, AttemptOutcome::PermanentFailure.as_str());
                    attempts.push(AttemptRecord::new(
                        candidate,
                        AttemptOutcome::PermanentFailure,
                        tries,
                        Some(error.to_string()),
                    ));
                }
                Err(CandidateFailure::Exhausted { error, tries }) => {
                    warn!(model = %model.id, tries = tries, error = %error, "Retries exhausted, moving to next candidate");
                    self.metrics
                        .record_gateway_attempt(&model.id, AttemptOutcome::RetriesExhausted.as_str());
                    attempts.push(AttemptRecord::new(
                        candidate,
                        AttemptOutcome::RetriesExhausted,
                        tries,
                        Some(error.to_string()),
                    ));
                }
            }
        }

        Err(GatewayError::AllCandidatesExhausted {
            capability: request.capability.clone(),
            attempts,
        })
    }

    async fn try_candidate(
        &self,
        candidate: &PlannedCandidate,
        provider: &Arc<dyn LlmProvider>,
        limiter: &Semaphore,
        request: &CompletionRequest,
    ) -> Result<(GenerationResponse, Option<Value>, u32), CandidateFailure> {
        let model = &candidate.model;
        let mut generation = GenerationRequest::new(model.id.clone(), request.messages.clone());
        generation.temperature = request.temperature;
        generation.max_tokens = request.max_tokens;

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.retry.delay_for(attempt - 1);
                debug!(
                    model = %model.id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = {
                let _permit = limiter
                    .acquire()
                    .await
                    .map_err(|_| CandidateFailure::Permanent {
                        error: LlmError::RequestFailed("provider limiter closed".to_string()),
                        tries: attempt - 1,
                    })?;

                match tokio::time::timeout(self.config.request_timeout, provider.generate(generation.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        millis: self.config.request_timeout.as_millis() as u64,
                    }),
                }
            };

            let result = result.and_then(|response| {
                let json = validate_reply(&request.response_format, &response)?;
                Ok((response, json))
            });

            match result {
                Ok((response, json)) => {
                    self.metrics.record_llm_request(
                        &model.id,
                        started.elapsed().as_secs_f64(),
                        response.usage.prompt_tokens as u64,
                        response.usage.completion_tokens as u64,
                        crate::llm::cost::estimate_cost(&response.usage, &model.pricing),
                    );
                    return Ok((response, json, attempt));
                }
                Err(error) if error.is_transient() => {
                    warn!(
                        model = %model.id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %error,
                        "Transient error"
                    );
                    last_error = Some(error);
                }
                Err(error) => {
                    return Err(CandidateFailure::Permanent { error, tries: attempt });
                }
            }
        }

        Err(CandidateFailure::Exhausted {
            error: last_error
                .unwrap_or_else(|| LlmError::RequestFailed("no attempt was made".to_string())),
            tries: max_attempts,
        })
    }
}

/// Checks a reply against the requested format, returning the parsed object
/// for JSON formats.
fn validate_reply(format: &ResponseFormat, response: &GenerationResponse) -> Result<Option<Value>, LlmError> {
    let content = response.first_content().unwrap_or_default();
    if content.trim().is_empty() {
        return Err(LlmError::SchemaMismatch("empty reply".to_string()));
    }

    let keys = match format {
        ResponseFormat::Text => return Ok(None),
        ResponseFormat::JsonObject { required_keys } => required_keys,
        ResponseFormat::Scores { keys } => keys,
    };

    let object = extract_json_object(content).map_err(|e| LlmError::SchemaMismatch(e.to_string()))?;

    let missing: Vec<&str> = keys
        .iter()
        .filter(|k| !object.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(LlmError::SchemaMismatch(format!(
            "missing key(s): {}",
            missing.join(", ")
        )));
    }

    if let ResponseFormat::Scores { keys } = format {
        for key in keys {
            if score_value(&object[key.as_str()]).is_none() {
                return Err(LlmError::SchemaMismatch(format!(
                    "'{}' is not a number or an object with a numeric score",
                    key
                )));
            }
        }
    }

    Ok(Some(Value::Object(object)))
}

/// Reads a score from a number or from `{"score": <number>, ...}`.
pub fn score_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map.get("score").and_then(Value::as_f64),
        _ => None,
    }
}
