//! Workflow engine: pipelines, parallel fan-out and routers.
//!
//! Every unit a workflow runs implements [`Executable`]: an [`AgentUnit`]
//! wraps one resilient call, and the workflows themselves implement it too,
//! so a pipeline can be a parallel branch, a router route can be a pipeline,
//! and so on.

mod parallel;
mod pipeline;
mod router;

pub use parallel::{Aggregator, Parallel, ParallelBranch};
pub use pipeline::{FailureAction, FailureHook, Pipeline, PipelineStep, StepCondition};
pub use router::{CustomRoute, InputTransform, Router, RulePredicate};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, TokenUsage, WorkflowChildren,
    WorkflowExecution, WorkflowKind, WorkflowStatus,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::executor::ResilientExecutor;

/// Input and prior results visible to a unit.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    input: Value,
    tenant_id: Option<String>,
    results: Vec<(String, ExecutionResult)>,
}

impl WorkflowContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            tenant_id: None,
            results: Vec::new(),
        }
    }

    /// Run on behalf of a tenant.
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Original workflow input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Results of earlier units, in completion order.
    pub fn results(&self) -> &[(String, ExecutionResult)] {
        &self.results
    }

    /// Most recent result.
    pub fn previous(&self) -> Option<&ExecutionResult> {
        self.results.last().map(|(_, r)| r)
    }

    /// Result of a named unit.
    pub fn result(&self, name: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    /// Content produced by a named unit.
    pub fn content(&self, name: &str) -> Option<&Value> {
        self.result(name).map(|r| &r.content)
    }

    /// What flows into the next unit: the previous content, else the input.
    pub fn handoff(&self) -> Value {
        self.previous()
            .map(|r| r.content.clone())
            .unwrap_or_else(|| self.input.clone())
    }

    /// Fresh context for a nested workflow, keeping the tenant.
    pub fn nested(&self, input: Value) -> Self {
        Self::new(input).with_tenant(self.tenant_id.clone())
    }

    pub(crate) fn push(&mut self, name: impl Into<String>, result: ExecutionResult) {
        self.results.push((name.into(), result));
    }
}

/// A unit of work a workflow can run.
#[async_trait]
pub trait Executable: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Builds a unit's payload from the context.
pub type InputMapper = Arc<dyn Fn(&WorkflowContext) -> Value + Send + Sync>;

/// One agent call as a workflow unit.
#[derive(Clone)]
pub struct AgentUnit {
    name: String,
    executor: ResilientExecutor,
    request: ExecutionRequest,
    input: Option<InputMapper>,
}

impl AgentUnit {
    /// Unit named after the request's agent.
    pub fn new(executor: ResilientExecutor, request: ExecutionRequest) -> Self {
        Self {
            name: request.agent().to_string(),
            executor,
            request,
            input: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Derive the payload from the context instead of the default handoff.
    pub fn with_input<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Value + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(mapper));
        self
    }

    /// The request template.
    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    /// Request for a given context.
    pub fn request_for(&self, ctx: &WorkflowContext) -> ExecutionRequest {
        let payload = match &self.input {
            Some(mapper) => mapper(ctx),
            None => ctx.handoff(),
        };
        let request = self.request.with_payload(payload);
        match ctx.tenant_id() {
            Some(tenant) => request.with_tenant(Some(tenant.to_string())),
            None => request,
        }
    }
}

#[async_trait]
impl Executable for AgentUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let request = self.request_for(ctx);
        self.executor.execute(&request, cancel).await
    }
}

/// Running totals of a workflow.
#[derive(Debug)]
pub(crate) struct Tally {
    pub(crate) workflow_id: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) clock: Instant,
    pub(crate) usage: TokenUsage,
    pub(crate) cost: f64,
}

impl Tally {
    pub(crate) fn start() -> Self {
        Self {
            workflow_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            clock: Instant::now(),
            usage: TokenUsage::default(),
            cost: 0.0,
        }
    }

    pub(crate) fn add_result(&mut self, result: &ExecutionResult) {
        self.usage.add(&result.usage);
        self.cost += result.cost;
    }

    /// Count whatever a failed unit spent.
    pub(crate) fn add_error(&mut self, error: &ExecutionError) {
        match error {
            ExecutionError::Workflow { execution } => {
                self.usage.add(&execution.usage);
                self.cost += execution.cost;
            }
            other => {
                if let Some(result) = other.result() {
                    self.add_result(result);
                }
            }
        }
    }

    pub(crate) fn finish(
        self,
        name: &str,
        kind: WorkflowKind,
        status: WorkflowStatus,
        children: WorkflowChildren,
        output: Value,
        error: Option<String>,
    ) -> WorkflowExecution {
        WorkflowExecution {
            workflow_id: self.workflow_id,
            name: name.to_string(),
            kind,
            status,
            children,
            output,
            usage: self.usage,
            cost: self.cost,
            started_at: self.started_at,
            duration: self.clock.elapsed(),
            error,
        }
    }
}

/// The result of a unit that failed, if it got far enough to have one.
pub(crate) fn failed_result(error: &ExecutionError) -> Option<ExecutionResult> {
    match error {
        ExecutionError::Workflow { execution } => Some(summarize(execution)),
        other => other.result().cloned(),
    }
}

/// Present a workflow run as one execution result, for nesting.
pub(crate) fn summarize(execution: &WorkflowExecution) -> ExecutionResult {
    let results = execution.results();
    let attempts = results.iter().flat_map(|r| r.attempts.iter().cloned()).collect();
    let first = results.first().map(|r| r.primary_model_id.clone()).unwrap_or_default();
    let last = results.last().map(|r| r.chosen_model_id.clone()).unwrap_or_default();
    let status = match execution.status {
        WorkflowStatus::Error => ExecutionStatus::Error,
        _ => ExecutionStatus::Success,
    };

    ExecutionResult {
        agent: execution.name.clone(),
        status,
        used_fallback: results.iter().any(|r| r.used_fallback),
        primary_model_id: first,
        chosen_model_id: last,
        attempts,
        usage: execution.usage,
        cost: execution.cost,
        content: execution.output.clone(),
        tenant_id: results.iter().find_map(|r| r.tenant_id.clone()),
        started_at: execution.started_at,
        duration: execution.duration,
        error_class: None,
        error_message: execution.error.clone(),
    }
}

/// Outcome of a nested workflow as an [`Executable`] result.
pub(crate) fn nested_outcome(execution: WorkflowExecution) -> Result<ExecutionResult, ExecutionError> {
    match execution.status {
        WorkflowStatus::Error => Err(ExecutionError::Workflow {
            execution: Box::new(execution),
        }),
        _ => Ok(summarize(&execution)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for workflow tests.

    use super::*;
    use crate::providers::ScriptedProvider;
    use crate::resilience::{BudgetLedger, CircuitBreaker};
    use relay_core::{BackoffPolicy, ModelPrice, PricingTable};
    use std::time::Duration;

    pub(crate) fn executor(provider: impl Into<Arc<ScriptedProvider>>) -> ResilientExecutor {
        let provider: Arc<ScriptedProvider> = provider.into();
        ResilientExecutor::new(
            provider,
            Arc::new(CircuitBreaker::default()),
            Arc::new(BudgetLedger::default()),
            Arc::new(PricingTable::flat(ModelPrice::new(1.0, 2.0))),
        )
    }

    /// Agent `name` calling model `name`, one retry.
    pub(crate) fn agent(executor: &ResilientExecutor, name: &str) -> AgentUnit {
        let request = ExecutionRequest::builder(name, name)
            .max_retries(1)
            .backoff(BackoffPolicy::constant(Duration::from_millis(100)).without_jitter())
            .build()
            .unwrap();
        AgentUnit::new(executor.clone(), request)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{agent, executor};
    use super::*;
    use crate::providers::{ScriptedOutcome, ScriptedProvider};

    #[test]
    fn test_context_handoff() {
        let mut ctx = WorkflowContext::new(Value::from("input"));
        assert_eq!(ctx.handoff(), Value::from("input"));

        let request = ExecutionRequest::builder("a", "m").build().unwrap();
        let mut result = testing_result(&request);
        result.content = Value::from("draft");
        ctx.push("draft", result);

        assert_eq!(ctx.handoff(), Value::from("draft"));
        assert_eq!(ctx.content("draft"), Some(&Value::from("draft")));
        assert!(ctx.result("missing").is_none());
    }

    fn testing_result(request: &ExecutionRequest) -> ExecutionResult {
        ExecutionResult {
            agent: request.agent().to_string(),
            status: ExecutionStatus::Success,
            primary_model_id: request.primary_model().to_string(),
            chosen_model_id: request.primary_model().to_string(),
            used_fallback: false,
            attempts: Vec::new(),
            usage: TokenUsage::default(),
            cost: 0.0,
            content: Value::Null,
            tenant_id: None,
            started_at: Utc::now(),
            duration: std::time::Duration::ZERO,
            error_class: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_agent_unit_uses_context_tenant_and_mapper() {
        let provider = ScriptedProvider::new().script("echo", [ScriptedOutcome::ok("done")]);
        let executor = executor(provider);
        let unit = agent(&executor, "echo").with_input(|ctx| serde_json::json!({"wrapped": ctx.input()}));

        let ctx = WorkflowContext::new(Value::from("hi")).with_tenant(Some("acme".into()));
        let request = unit.request_for(&ctx);
        assert_eq!(request.payload(), &serde_json::json!({"wrapped": "hi"}));
        assert_eq!(request.tenant_id(), Some("acme"));

        let result = unit.execute(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(result.content, Value::from("done"));
        assert_eq!(result.tenant_id.as_deref(), Some("acme"));
    }
}
