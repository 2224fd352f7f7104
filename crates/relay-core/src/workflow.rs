//! Records produced by workflows (pipeline, parallel, router).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::{ExecutionResult, TokenUsage};

/// Workflow shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Pipeline,
    Parallel,
    Router,
}

/// Terminal status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Every required unit succeeded and nothing degraded
    Success,
    /// Completed, but some units failed or were skipped after failure
    Partial,
    /// Aborted, or a required unit failed
    Error,
}

/// Outcome of one pipeline step or parallel branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step or branch name
    pub name: String,

    /// The unit's result, when it ran to a result
    pub result: Option<ExecutionResult>,

    /// Failure description, when it failed
    pub error: Option<String>,

    /// Whether failure of this unit fails the workflow
    pub required: bool,

    /// Not executed (condition false, or cancelled before start)
    pub skipped: bool,

    /// Executed and failed
    pub failed: bool,
}

/// Parallel branches share the step record shape.
pub type BranchResult = StepResult;

impl StepResult {
    /// A unit that ran and succeeded.
    pub fn succeeded(name: impl Into<String>, required: bool, result: ExecutionResult) -> Self {
        Self {
            name: name.into(),
            result: Some(result),
            error: None,
            required,
            skipped: false,
            failed: false,
        }
    }

    /// A unit that ran and failed.
    pub fn failed(
        name: impl Into<String>,
        required: bool,
        error: impl Into<String>,
        result: Option<ExecutionResult>,
    ) -> Self {
        Self {
            name: name.into(),
            result,
            error: Some(error.into()),
            required,
            skipped: false,
            failed: true,
        }
    }

    /// A unit that never ran.
    pub fn skipped(name: impl Into<String>, required: bool, reason: Option<String>) -> Self {
        Self {
            name: name.into(),
            result: None,
            error: reason,
            required,
            skipped: true,
            failed: false,
        }
    }

    /// Cost attributable to this unit.
    pub fn cost(&self) -> f64 {
        self.result.as_ref().map(|r| r.cost).unwrap_or(0.0)
    }

    /// Whether the unit ran and succeeded.
    pub fn is_success(&self) -> bool {
        !self.failed && !self.skipped && self.result.as_ref().is_some_and(|r| r.is_success())
    }
}

/// How the router picked its route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMethod {
    Rule,
    Llm,
    Custom,
    Default,
}

/// The router's classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Chosen route
    pub route_key: String,

    /// Strategy that produced it
    pub method: RouteMethod,

    /// Classifier confidence (LLM method only)
    pub confidence: Option<f64>,

    /// The classifier call (LLM method only)
    pub classifier_result: Option<ExecutionResult>,

    /// Why the default route was used, if it was
    #[serde(default)]
    pub fallback_reason: Option<String>,
}

/// Children of a workflow, by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowChildren {
    Pipeline {
        steps: Vec<StepResult>,
    },
    Parallel {
        branches: BTreeMap<String, BranchResult>,
    },
    Router {
        decision: Option<RouteDecision>,
        result: Option<StepResult>,
    },
}

/// One workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique run id
    pub workflow_id: String,

    /// Workflow name
    pub name: String,

    /// Workflow shape
    pub kind: WorkflowKind,

    /// Terminal status
    pub status: WorkflowStatus,

    /// Child outcomes
    pub children: WorkflowChildren,

    /// Workflow output
    pub output: Value,

    /// Summed usage of every call made
    pub usage: TokenUsage,

    /// Summed cost of every call made
    pub cost: f64,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Wall-clock duration
    #[serde(with = "crate::duration::millis")]
    pub duration: Duration,

    /// Abort reason, with the failing unit's name
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// Pipeline steps, if this is a pipeline.
    pub fn steps(&self) -> Option<&[StepResult]> {
        match &self.children {
            WorkflowChildren::Pipeline { steps } => Some(steps),
            _ => None,
        }
    }

    /// A pipeline step by name.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps()?.iter().find(|s| s.name == name)
    }

    /// Parallel branches, if this is a parallel run.
    pub fn branches(&self) -> Option<&BTreeMap<String, BranchResult>> {
        match &self.children {
            WorkflowChildren::Parallel { branches } => Some(branches),
            _ => None,
        }
    }

    /// A parallel branch by name.
    pub fn branch(&self, name: &str) -> Option<&BranchResult> {
        self.branches()?.get(name)
    }

    /// Route decision, if this is a router run.
    pub fn route(&self) -> Option<&RouteDecision> {
        match &self.children {
            WorkflowChildren::Router { decision, .. } => decision.as_ref(),
            _ => None,
        }
    }

    /// Result of the routed unit, if this is a router run.
    pub fn routed(&self) -> Option<&StepResult> {
        match &self.children {
            WorkflowChildren::Router { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    /// Every execution result under this workflow, in child order.
    pub fn results(&self) -> Vec<&ExecutionResult> {
        match &self.children {
            WorkflowChildren::Pipeline { steps } => {
                steps.iter().filter_map(|s| s.result.as_ref()).collect()
            }
            WorkflowChildren::Parallel { branches } => {
                branches.values().filter_map(|b| b.result.as_ref()).collect()
            }
            WorkflowChildren::Router { decision, result } => decision
                .iter()
                .filter_map(|d| d.classifier_result.as_ref())
                .chain(result.iter().filter_map(|r| r.result.as_ref()))
                .collect(),
        }
    }
}
