//! # relay-runtime
//!
//! Async side of relay: the resilient call executor and the workflow engine.
//!
//! A call goes through the [`ResilientExecutor`]:
//!
//! 1. the [`BudgetLedger`] reserves the projected cost or denies the call
//! 2. each candidate model is checked against the [`CircuitBreaker`]
//! 3. the [`LlmProvider`] is called with retries and backoff, falling back
//!    to the next model when one is exhausted
//! 4. the terminal [`relay_core::ExecutionResult`] goes to the sinks
//!
//! Workflows ([`Pipeline`], [`Parallel`], [`Router`]) compose calls through
//! the [`Executable`] trait, and nest.
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_runtime::{RelayRuntime, providers::ScriptedProvider};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = relay_core::RelayConfig::from_file("relay.yaml")?;
//! let runtime = RelayRuntime::new(Arc::new(ScriptedProvider::new()), config);
//!
//! let result = runtime
//!     .execute_call("summarizer", json!("..."), Some("acme"), CancellationToken::new())
//!     .await?;
//! println!("{} via {}", result.cost, result.chosen_model_id);
//! ```

pub mod error;
pub mod executor;
pub mod providers;
pub mod resilience;
pub mod runtime;
pub mod sinks;
pub mod workflow;

pub use error::{ExecutionError, RouterError, SinkError};
pub use executor::ResilientExecutor;
pub use providers::{LlmProvider, ProviderError, ProviderRegistry, ProviderResponse};
pub use resilience::{
    BreakerKey, BreakerStatus, BudgetDenial, BudgetLedger, BudgetStatus, BudgetWarning,
    CircuitBreaker, CircuitState,
};
pub use runtime::{RelayRuntime, RelayRuntimeBuilder, RuntimeError};
pub use sinks::{AlertEvent, AlertSink, ExecutionLogger, SinkDispatcher};
pub use workflow::{
    AgentUnit, Executable, Parallel, ParallelBranch, Pipeline, PipelineStep, Router,
    WorkflowContext,
};
