//! Runtime facade: configured executor, workflows and administration.
//!
//! [`RelayRuntime`] wires one provider, a breaker store, a budget ledger and
//! the sinks from a [`RelayConfig`], and exposes:
//!
//! - the caller-facing API: [`RelayRuntime::execute_call`],
//!   [`RelayRuntime::run_pipeline`], [`RelayRuntime::run_parallel`],
//!   [`RelayRuntime::run_router`]
//! - the administrative API: breaker status and overrides, budget status

use relay_core::{
    BudgetPeriod, BudgetScope, ConfigError, ExecutionRequest, ExecutionResult, RelayConfig,
    WorkflowExecution,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, RouterError};
use crate::executor::ResilientExecutor;
use crate::providers::LlmProvider;
use crate::resilience::{BreakerKey, BreakerStatus, BudgetLedger, BudgetStatus, CircuitBreaker};
use crate::sinks::SinkDispatcher;
use crate::workflow::{AgentUnit, Parallel, Pipeline, Router, WorkflowContext};

/// Errors from the runtime facade.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Configured executor plus administration.
#[derive(Clone)]
pub struct RelayRuntime {
    config: Arc<RelayConfig>,
    executor: ResilientExecutor,
}

impl RelayRuntime {
    /// Runtime with the tracing sinks.
    pub fn new(provider: Arc<dyn LlmProvider>, config: RelayConfig) -> Self {
        Self::with_sinks(provider, config, SinkDispatcher::tracing())
    }

    pub fn with_sinks(provider: Arc<dyn LlmProvider>, config: RelayConfig, sinks: SinkDispatcher) -> Self {
        Self::from_parts(provider, config, sinks, None)
    }

    fn from_parts(
        provider: Arc<dyn LlmProvider>,
        config: RelayConfig,
        sinks: SinkDispatcher,
        ledger: Option<BudgetLedger>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let ledger = Arc::new(ledger.unwrap_or_else(|| BudgetLedger::new(config.budgets.clone())));
        let pricing = Arc::new(config.pricing_table());
        let executor = ResilientExecutor::new(provider, breakers, ledger, pricing).with_sinks(sinks);

        tracing::info!(
            agents = config.agents.len(),
            provider = executor.provider().name(),
            "Relay runtime ready"
        );

        Self {
            config: Arc::new(config),
            executor,
        }
    }

    pub fn builder() -> RelayRuntimeBuilder {
        RelayRuntimeBuilder::new()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The shared executor.
    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// Request for a configured agent.
    pub fn request(
        &self,
        agent: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<ExecutionRequest, ConfigError> {
        self.config.request(agent, payload, tenant_id)
    }

    /// Call a configured agent.
    pub async fn execute_call(
        &self,
        agent: &str,
        payload: Value,
        tenant_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, RuntimeError> {
        let request = self.request(agent, payload, tenant_id)?;
        Ok(self.executor.execute(&request, cancel).await?)
    }

    /// Run a prepared request.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.executor.execute(request, cancel).await
    }

    /// Workflow unit for a configured agent.
    pub fn agent(&self, name: &str) -> Result<AgentUnit, ConfigError> {
        let request = self.request(name, Value::Null, None)?;
        Ok(AgentUnit::new(self.executor.clone(), request))
    }

    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        input: Value,
        tenant_id: Option<&str>,
        cancel: CancellationToken,
    ) -> WorkflowExecution {
        let execution = pipeline.run(context(input, tenant_id), cancel).await;
        self.executor.sinks().log_workflow(&execution);
        execution
    }

    pub async fn run_parallel(
        &self,
        parallel: &Parallel,
        input: Value,
        tenant_id: Option<&str>,
        cancel: CancellationToken,
    ) -> WorkflowExecution {
        let execution = parallel.run(context(input, tenant_id), cancel).await;
        self.executor.sinks().log_workflow(&execution);
        execution
    }

    pub async fn run_router(
        &self,
        router: &Router,
        input: Value,
        tenant_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution, RouterError> {
        let execution = router.run(context(input, tenant_id), cancel).await?;
        self.executor.sinks().log_workflow(&execution);
        Ok(execution)
    }

    pub fn breaker_status(&self, key: &BreakerKey) -> Option<BreakerStatus> {
        self.executor.breakers().status(key)
    }

    /// Every tracked breaker.
    pub fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        self.executor.breakers().statuses()
    }

    /// Open a breaker by hand, for `cooldown` or the default cooldown.
    pub fn force_open(&self, key: &BreakerKey, cooldown: Option<Duration>) {
        tracing::warn!(breaker = %key, "Breaker forced open");
        self.executor.breakers().force_open(key, cooldown);
    }

    pub fn force_close(&self, key: &BreakerKey) {
        tracing::info!(breaker = %key, "Breaker forced closed");
        self.executor.breakers().force_close(key);
    }

    pub fn reset_breakers(&self) {
        self.executor.breakers().reset_all();
    }

    /// Ledger entries of a scope for the current periods.
    pub fn budget_status(&self, scope: &BudgetScope) -> Vec<BudgetStatus> {
        self.executor.ledger().status(scope)
    }

    pub fn budget_remaining(&self, scope: &BudgetScope, period: BudgetPeriod) -> Option<f64> {
        self.executor.ledger().remaining(scope, period)
    }

    /// Wait for outstanding sink deliveries.
    pub async fn flush(&self) {
        self.executor.sinks().flush().await;
    }
}

impl std::fmt::Debug for RelayRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRuntime")
            .field("agents", &self.config.agents.keys().collect::<Vec<_>>())
            .field("executor", &self.executor)
            .finish()
    }
}

fn context(input: Value, tenant_id: Option<&str>) -> WorkflowContext {
    WorkflowContext::new(input).with_tenant(tenant_id.map(str::to_string))
}

/// Builder for [`RelayRuntime`].
pub struct RelayRuntimeBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    config: RelayConfig,
    sinks: SinkDispatcher,
    ledger: Option<BudgetLedger>,
}

impl RelayRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            config: RelayConfig::default(),
            sinks: SinkDispatcher::tracing(),
            ledger: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sinks(mut self, sinks: SinkDispatcher) -> Self {
        self.sinks = sinks;
        self
    }

    /// Use a prepared ledger (e.g. one with a test clock) instead of one
    /// built from `config.budgets`.
    pub fn ledger(mut self, ledger: BudgetLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<RelayRuntime, RuntimeError> {
        let provider = self
            .provider
            .ok_or_else(|| RuntimeError::ProviderNotConfigured("No provider set".to_string()))?;
        Ok(RelayRuntime::from_parts(provider, self.config, self.sinks, self.ledger))
    }
}

impl Default for RelayRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ScriptedOutcome, ScriptedProvider};
    use crate::resilience::CircuitState;
    use crate::sinks::RecordingSink;
    use crate::workflow::PipelineStep;
    use relay_core::{ErrorClass, WorkflowStatus};

    const CONFIG: &str = r#"
defaults:
  max_retries: 0
circuit_breaker:
  errors: 1
  within: 60s
  cooldown: 30s
budgets:
  global:
    daily: 10.0
agents:
  writer:
    model: primary
    fallback_models: [backup]
"#;

    fn runtime(provider: ScriptedProvider) -> (RelayRuntime, Arc<RecordingSink>) {
        let recording = Arc::new(RecordingSink::new());
        let sinks = SinkDispatcher::new()
            .with_logger(recording.clone())
            .with_alert_sink(recording.clone());
        let runtime = RelayRuntime::builder()
            .provider(Arc::new(provider))
            .config(RelayConfig::from_yaml(CONFIG).unwrap())
            .sinks(sinks)
            .build()
            .unwrap();
        (runtime, recording)
    }

    #[test]
    fn test_builder_requires_provider() {
        let error = RelayRuntime::builder().build().unwrap_err();
        assert!(matches!(error, RuntimeError::ProviderNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_execute_call_unknown_agent() {
        let (runtime, _) = runtime(ScriptedProvider::new());
        let error = runtime
            .execute_call("missing", Value::Null, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, RuntimeError::Config(ConfigError::UnknownAgent(_))));
    }

    #[tokio::test]
    async fn test_execute_call_falls_back_and_logs() {
        let provider = ScriptedProvider::new().script("primary", [ScriptedOutcome::fail(ErrorClass::ServerError)]);
        let (runtime, recording) = runtime(provider);

        let result = runtime
            .execute_call("writer", Value::from("hi"), Some("acme"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.chosen_model_id, "backup");
        assert!(result.used_fallback);

        runtime.flush().await;
        assert_eq!(recording.executions().len(), 1);
        assert!(recording.alert_names().contains(&"breaker_open"));

        let key = BreakerKey::new("writer", "primary", Some("acme"));
        assert_eq!(runtime.breaker_status(&key).unwrap().state, CircuitState::Open);
        runtime.force_close(&key);
        assert_eq!(runtime.breaker_status(&key).unwrap().state, CircuitState::Closed);

        let remaining = runtime.budget_remaining(&BudgetScope::Global, BudgetPeriod::Daily).unwrap();
        assert!(remaining < 10.0);
    }

    #[tokio::test]
    async fn test_force_open_blocks_calls() {
        let (runtime, _) = runtime(ScriptedProvider::new());
        runtime.force_open(&BreakerKey::new("writer", "primary", None), None);
        runtime.force_open(&BreakerKey::new("writer", "backup", None), None);

        let error = runtime
            .execute_call("writer", Value::Null, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, RuntimeError::Execution(ExecutionError::CircuitOpen { .. })));

        runtime.reset_breakers();
        assert!(runtime.breaker_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_run_pipeline_logs_workflow() {
        let (runtime, recording) = runtime(ScriptedProvider::new());
        let pipeline = Pipeline::new("draft").step(PipelineStep::new("write", runtime.agent("writer").unwrap()));

        let execution = runtime
            .run_pipeline(&pipeline, Value::from("topic"), None, CancellationToken::new())
            .await;
        assert_eq!(execution.status, WorkflowStatus::Success);

        runtime.flush().await;
        assert_eq!(recording.workflows().len(), 1);
        assert_eq!(recording.workflows()[0].name, "draft");
    }
}
