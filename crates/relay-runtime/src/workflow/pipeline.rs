//! Sequential pipeline of named steps.

use async_trait::async_trait;
use relay_core::{StepResult, WorkflowChildren, WorkflowExecution, WorkflowKind, WorkflowStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{failed_result, nested_outcome, Executable, Tally, WorkflowContext};
use crate::error::ExecutionError;

/// Decides whether a step runs.
pub type StepCondition = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// What to do after a required step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Mark the step failed and continue
    Skip,
    /// Stop the pipeline
    Abort,
}

/// Per-pipeline failure policy: `(step name, error, context) -> action`.
pub type FailureHook =
    Arc<dyn Fn(&str, &ExecutionError, &WorkflowContext) -> FailureAction + Send + Sync>;

/// One step of a pipeline.
#[derive(Clone)]
pub struct PipelineStep {
    name: String,
    unit: Arc<dyn Executable>,
    required: bool,
    condition: Option<StepCondition>,
}

impl PipelineStep {
    /// A required step.
    pub fn new(name: impl Into<String>, unit: impl Executable + 'static) -> Self {
        Self::shared(name, Arc::new(unit))
    }

    /// A required step over a shared unit.
    pub fn shared(name: impl Into<String>, unit: Arc<dyn Executable>) -> Self {
        Self {
            name: name.into(),
            unit,
            required: true,
            condition: None,
        }
    }

    /// Failure is recorded but does not stop the pipeline.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Run only when `condition` holds; otherwise skip without failing.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Skip when `condition` holds.
    pub fn unless<F>(self, condition: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.when(move |ctx| !condition(ctx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// Steps run one after another; each sees every earlier result.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<PipelineStep>,
    on_failure: Option<FailureHook>,
    max_cost: Option<f64>,
    timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            on_failure: None,
            max_cost: None,
            timeout: None,
        }
    }

    pub fn step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Override the abort-on-required-failure default.
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &ExecutionError, &WorkflowContext) -> FailureAction + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// Stop before a step once cumulative cost exceeds `max_cost`.
    pub fn max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    /// Stop before a step once elapsed time exceeds `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    fn limit_reached(&self, tally: &Tally) -> Option<String> {
        if let Some(max_cost) = self.max_cost {
            if tally.cost > max_cost {
                return Some(format!("max_cost {:.4} exceeded ({:.4} spent)", max_cost, tally.cost));
            }
        }
        if let Some(timeout) = self.timeout {
            if tally.clock.elapsed() > timeout {
                return Some(format!("timeout of {:?} exceeded", timeout));
            }
        }
        None
    }

    /// Run the pipeline.
    pub async fn run(&self, mut ctx: WorkflowContext, cancel: CancellationToken) -> WorkflowExecution {
        let mut tally = Tally::start();
        let mut steps: Vec<StepResult> = Vec::with_capacity(self.steps.len());
        let mut degraded = false;
        let mut abort: Option<String> = None;
        let mut output = Value::Null;

        for step in &self.steps {
            if let Some(reason) = &abort {
                steps.push(StepResult::skipped(&step.name, step.required, Some(format!("aborted: {}", reason))));
                continue;
            }

            let stop = if cancel.is_cancelled() {
                Some("cancelled".to_string())
            } else {
                self.limit_reached(&tally)
            };
            if let Some(reason) = stop {
                tracing::warn!(pipeline = %self.name, step = %step.name, %reason, "Pipeline aborted");
                steps.push(StepResult::skipped(&step.name, step.required, Some(reason.clone())));
                abort = Some(reason);
                continue;
            }

            if let Some(condition) = &step.condition {
                if !condition(&ctx) {
                    tracing::debug!(pipeline = %self.name, step = %step.name, "Condition false, skipping step");
                    steps.push(StepResult::skipped(&step.name, step.required, Some("condition not met".into())));
                    continue;
                }
            }

            match step.unit.execute(&ctx, cancel.clone()).await {
                Ok(result) => {
                    tally.add_result(&result);
                    output = result.content.clone();
                    ctx.push(step.name.clone(), result.clone());
                    steps.push(StepResult::succeeded(&step.name, step.required, result));
                }
                Err(error) => {
                    tally.add_error(&error);
                    let message = error.to_string();
                    steps.push(StepResult::failed(&step.name, step.required, &message, failed_result(&error)));

                    if !step.required {
                        tracing::info!(pipeline = %self.name, step = %step.name, error = %message, "Optional step failed");
                        degraded = true;
                        continue;
                    }

                    let action = match &self.on_failure {
                        Some(hook) => hook(&step.name, &error, &ctx),
                        None => FailureAction::Abort,
                    };
                    match action {
                        FailureAction::Skip => {
                            tracing::info!(pipeline = %self.name, step = %step.name, "Required step failed, continuing");
                            degraded = true;
                        }
                        FailureAction::Abort => {
                            tracing::warn!(pipeline = %self.name, step = %step.name, error = %message, "Required step failed, aborting");
                            abort = Some(format!("step '{}' failed: {}", step.name, message));
                        }
                    }
                }
            }
        }

        let status = match (&abort, degraded) {
            (Some(_), _) => WorkflowStatus::Error,
            (None, true) => WorkflowStatus::Partial,
            (None, false) => WorkflowStatus::Success,
        };

        tally.finish(
            &self.name,
            WorkflowKind::Pipeline,
            status,
            WorkflowChildren::Pipeline { steps },
            output,
            abort,
        )
    }
}

#[async_trait]
impl Executable for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<relay_core::ExecutionResult, ExecutionError> {
        nested_outcome(self.run(ctx.nested(ctx.handoff()), cancel).await)
    }
}
