//! # relay-core
//!
//! Deterministic building blocks for resilient LLM agent calls.
//!
//! This crate holds everything that does not need an async runtime:
//!
//! 1. **Data model**: [`ExecutionRequest`], [`AttemptRecord`],
//!    [`ExecutionResult`] and the workflow records
//! 2. **Backoff**: [`BackoffPolicy`], a pure delay function with jitter
//! 3. **Classification**: [`RetryClassifier`] decides which provider
//!    failures are retried
//! 4. **Pricing**: [`PricingTable`] turns token counts into cost
//! 5. **Configuration**: [`RelayConfig`] loaded from YAML/JSON and
//!    validated against an embedded JSON Schema
//!
//! The async executor, circuit breaker, budget ledger and workflow engine
//! live in `relay-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_core::{RelayConfig, projected_cost};
//!
//! let config = RelayConfig::from_file("relay.yaml")?;
//! let request = config.request("summarizer", serde_json::json!("..."), Some("acme"))?;
//! let estimate = projected_cost(&request, &config.pricing_table());
//! ```

pub mod backoff;
pub mod classify;
pub mod config;
pub mod duration;
pub mod pricing;
pub mod types;
pub mod workflow;

// Re-export main types at crate root
pub use backoff::{BackoffKind, BackoffPolicy};
pub use classify::{ErrorClass, RetryClassifier, RetryRule};
pub use config::{AgentConfig, BudgetConfig, BudgetLimits, ConfigError, RelayConfig};
pub use pricing::{ModelPrice, PricingTable};
pub use types::{
    AttemptRecord, BreakerSettings, BudgetPeriod, BudgetScope, Enforcement, ExecutionRequest,
    ExecutionRequestBuilder, ExecutionResult, ExecutionStatus, ReliabilityConfig, RequestError,
    TokenUsage,
};
pub use workflow::{
    BranchResult, RouteDecision, RouteMethod, StepResult, WorkflowChildren, WorkflowExecution,
    WorkflowKind, WorkflowStatus,
};

/// Projected cost of a request, used by the budget pre-check.
///
/// An explicit `projected_cost` on the request wins. Otherwise the payload
/// size and `max_output_tokens` are priced on the primary model.
pub fn projected_cost(request: &ExecutionRequest, pricing: &PricingTable) -> f64 {
    projected_cost_for(request, request.primary_model(), pricing)
}

/// Projected cost of one attempt of `request` on `model_id`.
pub fn projected_cost_for(request: &ExecutionRequest, model_id: &str, pricing: &PricingTable) -> f64 {
    if let Some(cost) = request.projected_cost() {
        return cost;
    }

    let payload_chars = match request.payload() {
        serde_json::Value::Null => 0,
        serde_json::Value::String(s) => s.len(),
        other => other.to_string().len(),
    };

    pricing.projected_cost(model_id, payload_chars, request.reliability().max_output_tokens)
}
