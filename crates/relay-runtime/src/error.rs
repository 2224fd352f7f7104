//! Errors surfaced to callers of the executor and the workflow engine.

use chrono::{DateTime, Utc};
use relay_core::{ErrorClass, ExecutionResult, WorkflowExecution};
use std::time::Duration;
use thiserror::Error;

use crate::resilience::BudgetDenial;

/// Terminal failure of one resilient call.
///
/// Variants raised after at least one provider call carry the terminal
/// [`ExecutionResult`] with the full attempt history.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// Denied up front (no `result`) or before a retry or fallback attempt
    #[error("Budget denied for agent '{agent}': {denial}")]
    BudgetExceeded {
        agent: String,
        denial: BudgetDenial,
        result: Option<Box<ExecutionResult>>,
    },

    #[error("Circuit open for every candidate model of agent '{agent}' (retry after {retry_after:?})")]
    CircuitOpen {
        agent: String,
        retry_after: Duration,
        cooldown_until: DateTime<Utc>,
    },

    #[error("Total timeout of {timeout:?} exceeded after {} attempts", .result.attempts.len())]
    Timeout {
        timeout: Duration,
        result: Box<ExecutionResult>,
    },

    #[error("All candidate models failed for agent '{}' (last error: {})", .result.agent, .last_error.map(|c| c.as_str()).unwrap_or("none"))]
    ExhaustedFallbacks {
        result: Box<ExecutionResult>,
        last_error: Option<ErrorClass>,
    },

    #[error("Execution cancelled")]
    Cancelled { result: Option<Box<ExecutionResult>> },

    #[error("Workflow '{}' failed: {}", .execution.name, .execution.error.as_deref().unwrap_or("error"))]
    Workflow { execution: Box<WorkflowExecution> },
}

impl ExecutionError {
    /// Short name of the variant, for logs and alerts.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::BudgetExceeded { .. } => "budget_exceeded",
            ExecutionError::CircuitOpen { .. } => "circuit_open",
            ExecutionError::Timeout { .. } => "timeout",
            ExecutionError::ExhaustedFallbacks { .. } => "exhausted_fallbacks",
            ExecutionError::Cancelled { .. } => "cancelled",
            ExecutionError::Workflow { .. } => "workflow",
        }
    }

    /// The terminal result, when any provider call was made.
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            ExecutionError::Timeout { result, .. } | ExecutionError::ExhaustedFallbacks { result, .. } => {
                Some(result)
            }
            ExecutionError::Cancelled { result } | ExecutionError::BudgetExceeded { result, .. } => {
                result.as_deref()
            }
            _ => None,
        }
    }

    /// Cost already spent before the failure.
    pub fn cost(&self) -> f64 {
        match self {
            ExecutionError::Workflow { execution } => execution.cost,
            other => other.result().map(|r| r.cost).unwrap_or(0.0),
        }
    }
}

/// Router configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Router '{router}' resolved no declared route and has no default: {reason}")]
    NoRoute { router: String, reason: String },

    #[error("Router '{router}' default route '{route}' is not declared")]
    UndeclaredDefault { router: String, route: String },

    #[error("Router '{0}' declares no routes")]
    NoRoutes(String),
}

/// Delivery failure of an execution logger or alert sink.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Sink '{sink}' delivery failed: {message}")]
pub struct SinkError {
    pub sink: String,
    pub message: String,
}

impl SinkError {
    pub fn new(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            message: message.into(),
        }
    }
}
