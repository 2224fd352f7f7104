//! Core types for resilient agent calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::classify::{ErrorClass, RetryClassifier};

/// Token counts of one or more provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub input_tokens: u32,

    /// Tokens generated
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Create a usage record.
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Accumulate another usage.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    /// True when no tokens were consumed.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Circuit breaker thresholds.
///
/// The breaker opens after `errors` failures within `within`, and stays open
/// for `cooldown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Failures before opening
    pub errors: u32,

    /// Sliding window for counting failures
    #[serde(with = "crate::duration::human")]
    pub within: Duration,

    /// Time the breaker stays open
    #[serde(with = "crate::duration::human")]
    pub cooldown: Duration,

    /// Key breakers by tenant as well as agent and model
    #[serde(default = "default_tenant_isolation")]
    pub tenant_isolation: bool,
}

fn default_tenant_isolation() -> bool {
    true
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            errors: 5,
            within: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            tenant_isolation: true,
        }
    }
}

impl BreakerSettings {
    /// Settings with the given thresholds and tenant isolation on.
    pub fn new(errors: u32, within: Duration, cooldown: Duration) -> Self {
        Self {
            errors,
            within,
            cooldown,
            tenant_isolation: true,
        }
    }
}

/// Retry, backoff and timeout behavior of one logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Retries per candidate model (attempts = `max_retries + 1`)
    #[serde(default)]
    pub max_retries: u32,

    /// Delay between retries
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Wall-clock budget for the whole call, across all models
    #[serde(default, with = "crate::duration::human_opt")]
    pub total_timeout: Option<Duration>,

    /// Which failures are retried against the same model
    #[serde(default)]
    pub retry_on: RetryClassifier,

    /// Output token ceiling, used for projected cost
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_max_output_tokens() -> u32 {
    500
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffPolicy::default(),
            total_timeout: None,
            retry_on: RetryClassifier::default(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// A budget scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BudgetScope {
    /// All calls
    Global,
    /// Calls of one agent type
    Agent(String),
    /// Calls on behalf of one tenant
    Tenant(String),
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Global => f.write_str("global"),
            BudgetScope::Agent(name) => write!(f, "agent:{}", name),
            BudgetScope::Tenant(id) => write!(f, "tenant:{}", id),
        }
    }
}

/// Budget accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl BudgetPeriod {
    /// Both periods, in a fixed order.
    pub const ALL: [BudgetPeriod; 2] = [BudgetPeriod::Daily, BudgetPeriod::Monthly];

    /// Bucket label for a wall-clock instant (`2025-01-31`, `2025-01`).
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            BudgetPeriod::Daily => now.format("%Y-%m-%d").to_string(),
            BudgetPeriod::Monthly => now.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPeriod::Daily => f.write_str("daily"),
            BudgetPeriod::Monthly => f.write_str("monthly"),
        }
    }
}

/// What happens when a budget limit would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Track only
    #[default]
    None,
    /// Allow, but raise an alert
    Soft,
    /// Deny before any provider call
    Hard,
}

/// Errors building an [`ExecutionRequest`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Agent name is empty")]
    EmptyAgent,

    #[error("Candidate model list is empty")]
    NoModels,

    #[error("Model '{0}' appears more than once in the fallback chain")]
    DuplicateModel(String),

    #[error("Projected cost must be non-negative, got {0}")]
    NegativeProjectedCost(f64),
}

/// A request to call an agent.
///
/// Immutable once built; [`with_payload`](Self::with_payload) and
/// [`with_tenant`](Self::with_tenant) return modified copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRequest {
    agent: String,
    models: Vec<String>,
    reliability: ReliabilityConfig,
    circuit_breaker: Option<BreakerSettings>,
    tenant_id: Option<String>,
    payload: Value,
    projected_cost: Option<f64>,
}

impl ExecutionRequest {
    /// Start building a request for `agent` with a primary model.
    pub fn builder(agent: impl Into<String>, primary_model: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequestBuilder {
            agent: agent.into(),
            models: vec![primary_model.into()],
            reliability: ReliabilityConfig::default(),
            circuit_breaker: None,
            tenant_id: None,
            payload: Value::Null,
            projected_cost: None,
        }
    }

    /// Agent type name.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Candidate models, primary first.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// The primary model.
    pub fn primary_model(&self) -> &str {
        &self.models[0]
    }

    /// Retry/backoff/timeout settings.
    pub fn reliability(&self) -> &ReliabilityConfig {
        &self.reliability
    }

    /// Breaker override for this agent.
    pub fn circuit_breaker(&self) -> Option<&BreakerSettings> {
        self.circuit_breaker.as_ref()
    }

    /// Tenant the call is made for.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Opaque prompt payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Explicit projected cost, if set.
    pub fn projected_cost(&self) -> Option<f64> {
        self.projected_cost
    }

    /// Budget scopes this call is charged to.
    pub fn budget_scopes(&self) -> Vec<BudgetScope> {
        let mut scopes = vec![BudgetScope::Global, BudgetScope::Agent(self.agent.clone())];
        if let Some(tenant) = &self.tenant_id {
            scopes.push(BudgetScope::Tenant(tenant.clone()));
        }
        scopes
    }

    /// Copy with a different payload.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Copy with a different tenant.
    pub fn with_tenant(&self, tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            ..self.clone()
        }
    }
}

/// Builder for [`ExecutionRequest`].
#[derive(Debug, Clone)]
pub struct ExecutionRequestBuilder {
    agent: String,
    models: Vec<String>,
    reliability: ReliabilityConfig,
    circuit_breaker: Option<BreakerSettings>,
    tenant_id: Option<String>,
    payload: Value,
    projected_cost: Option<f64>,
}

impl ExecutionRequestBuilder {
    /// Append a fallback model.
    pub fn fallback(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    /// Append several fallback models.
    pub fn fallbacks<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    /// Replace the whole reliability config.
    pub fn reliability(mut self, reliability: ReliabilityConfig) -> Self {
        self.reliability = reliability;
        self
    }

    /// Retries per model.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.reliability.max_retries = max_retries;
        self
    }

    /// Backoff policy.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.reliability.backoff = backoff;
        self
    }

    /// Total timeout across all attempts.
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.reliability.total_timeout = Some(timeout);
        self
    }

    /// Retry classification rules.
    pub fn retry_on(mut self, classifier: RetryClassifier) -> Self {
        self.reliability.retry_on = classifier;
        self
    }

    /// Circuit breaker override.
    pub fn circuit_breaker(mut self, settings: BreakerSettings) -> Self {
        self.circuit_breaker = Some(settings);
        self
    }

    /// Tenant the call is made for.
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Prompt payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Explicit projected cost for the budget pre-check.
    pub fn projected_cost(mut self, cost: f64) -> Self {
        self.projected_cost = Some(cost);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ExecutionRequest, RequestError> {
        if self.agent.trim().is_empty() {
            return Err(RequestError::EmptyAgent);
        }
        if self.models.is_empty() || self.models.iter().any(|m| m.trim().is_empty()) {
            return Err(RequestError::NoModels);
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.as_str()) {
                return Err(RequestError::DuplicateModel(model.clone()));
            }
        }
        if let Some(cost) = self.projected_cost {
            if cost < 0.0 {
                return Err(RequestError::NegativeProjectedCost(cost));
            }
        }

        Ok(ExecutionRequest {
            agent: self.agent,
            models: self.models,
            reliability: self.reliability,
            circuit_breaker: self.circuit_breaker,
            tenant_id: self.tenant_id,
            payload: self.payload,
            projected_cost: self.projected_cost,
        })
    }
}

/// One provider call made while executing a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Model called
    pub model_id: String,

    /// 0-based attempt number against this model
    pub attempt_index: u32,

    /// When the call started
    pub started_at: DateTime<Utc>,

    /// Call latency
    #[serde(with = "crate::duration::millis")]
    pub duration: Duration,

    /// Whether the call succeeded
    pub success: bool,

    /// Failure class, if it failed
    pub error_kind: Option<ErrorClass>,

    /// Failure message, if it failed
    pub error_message: Option<String>,

    /// Whether the failure was classified retryable
    pub retryable: bool,

    /// Tokens consumed by this call
    pub usage: TokenUsage,

    /// Cost of this call
    pub cost: f64,

    /// Completed after cancellation was requested; its outcome was ignored
    #[serde(default)]
    pub late: bool,
}

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Result of one resilient call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Agent type name
    pub agent: String,

    /// Terminal status
    pub status: ExecutionStatus,

    /// First candidate model
    pub primary_model_id: String,

    /// Model that succeeded, or the last one tried
    pub chosen_model_id: String,

    /// `chosen_model_id != primary_model_id`
    pub used_fallback: bool,

    /// Every provider call, in order
    pub attempts: Vec<AttemptRecord>,

    /// Summed token usage of all attempts
    pub usage: TokenUsage,

    /// Summed cost of all attempts
    pub cost: f64,

    /// Provider output (null on error)
    pub content: Value,

    /// Tenant the call was made for
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// When the execution started
    pub started_at: DateTime<Utc>,

    /// Wall-clock duration
    #[serde(with = "crate::duration::millis")]
    pub duration: Duration,

    /// Class of the last failure
    #[serde(default)]
    pub error_class: Option<ErrorClass>,

    /// Message of the last failure
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Number of attempts made against one model.
    pub fn attempts_for(&self, model_id: &str) -> usize {
        self.attempts.iter().filter(|a| a.model_id == model_id).count()
    }

    /// Distinct models attempted, in order.
    pub fn models_tried(&self) -> Vec<&str> {
        let mut models: Vec<&str> = Vec::new();
        for attempt in &self.attempts {
            if !models.contains(&attempt.model_id.as_str()) {
                models.push(&attempt.model_id);
            }
        }
        models
    }
}
