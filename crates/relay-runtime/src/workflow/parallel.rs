//! Concurrent fan-out over named branches.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use relay_core::{
    BranchResult, ExecutionResult, WorkflowChildren, WorkflowExecution, WorkflowKind,
    WorkflowStatus,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{failed_result, nested_outcome, Executable, Tally, WorkflowContext};
use crate::error::ExecutionError;

/// Turns the branch results into the workflow output.
pub type Aggregator = Arc<dyn Fn(&BTreeMap<String, BranchResult>) -> Value + Send + Sync>;

/// One branch of a parallel run.
#[derive(Clone)]
pub struct ParallelBranch {
    name: String,
    unit: Arc<dyn Executable>,
    required: bool,
}

impl ParallelBranch {
    /// A required branch.
    pub fn new(name: impl Into<String>, unit: impl Executable + 'static) -> Self {
        Self::shared(name, Arc::new(unit))
    }

    pub fn shared(name: impl Into<String>, unit: Arc<dyn Executable>) -> Self {
        Self {
            name: name.into(),
            unit,
            required: true,
        }
    }

    /// Failure degrades the run instead of failing it.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

enum Outcome {
    NotStarted,
    Ran(Result<ExecutionResult, ExecutionError>),
}

/// Branches run concurrently on a bounded number of slots.
#[derive(Clone)]
pub struct Parallel {
    name: String,
    branches: Vec<ParallelBranch>,
    concurrency: Option<usize>,
    fail_fast: bool,
    timeout: Option<Duration>,
    max_cost: Option<f64>,
    aggregator: Option<Aggregator>,
    tolerate_optional_failures: bool,
}

impl Parallel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            concurrency: None,
            fail_fast: false,
            timeout: None,
            max_cost: None,
            aggregator: None,
            tolerate_optional_failures: false,
        }
    }

    pub fn branch(mut self, branch: ParallelBranch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Maximum branches in flight (default: all of them).
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    /// Cancel the rest as soon as a required branch fails.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    /// Custom output instead of the name -> result map.
    pub fn aggregate<F>(mut self, aggregator: F) -> Self
    where
        F: Fn(&BTreeMap<String, BranchResult>) -> Value + Send + Sync + 'static,
    {
        self.aggregator = Some(Arc::new(aggregator));
        self
    }

    /// Report `success` rather than `partial` when only optional branches fail.
    pub fn tolerate_optional_failures(mut self) -> Self {
        self.tolerate_optional_failures = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run every branch.
    pub async fn run(&self, ctx: WorkflowContext, cancel: CancellationToken) -> WorkflowExecution {
        let mut tally = Tally::start();
        let stop = cancel.child_token();
        let slots = Semaphore::new(self.concurrency.unwrap_or(self.branches.len()).max(1));
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut pending: FuturesUnordered<_> = self
            .branches
            .iter()
            .enumerate()
            .map(|(index, branch)| {
                let (ctx, stop, slots) = (&ctx, &stop, &slots);
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = stop.cancelled() => None,
                        permit = slots.acquire() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return (index, Outcome::NotStarted);
                    };
                    if stop.is_cancelled() {
                        return (index, Outcome::NotStarted);
                    }
                    (index, Outcome::Ran(branch.unit.execute(ctx, stop.clone()).await))
                }
            })
            .collect();

        let mut outcomes: Vec<Option<Outcome>> = self.branches.iter().map(|_| None).collect();
        let mut abort: Option<String> = None;
        let mut timer_armed = deadline.is_some();

        while !pending.is_empty() {
            let next = match deadline {
                Some(at) if timer_armed => {
                    tokio::select! {
                        next = pending.next() => next,
                        _ = tokio::time::sleep_until(at) => {
                            timer_armed = false;
                            if abort.is_none() {
                                let reason = format!("timeout of {:?} exceeded", self.timeout.unwrap_or_default());
                                tracing::warn!(parallel = %self.name, %reason, "Cancelling remaining branches");
                                abort = Some(reason);
                            }
                            stop.cancel();
                            continue;
                        }
                    }
                }
                _ => pending.next().await,
            };
            let Some((index, outcome)) = next else {
                break;
            };
            let branch = &self.branches[index];

            if let Outcome::Ran(ran) = &outcome {
                match ran {
                    Ok(result) => tally.add_result(result),
                    Err(error) => {
                        tally.add_error(error);
                        if branch.required && self.fail_fast && abort.is_none() && !stop.is_cancelled() {
                            let reason = format!("branch '{}' failed: {}", branch.name, error);
                            tracing::warn!(parallel = %self.name, branch = %branch.name, error = %error, "Required branch failed, cancelling the rest");
                            abort = Some(reason);
                            stop.cancel();
                        }
                    }
                }
            }

            if let Some(max_cost) = self.max_cost {
                if tally.cost > max_cost && abort.is_none() {
                    let reason = format!("max_cost {:.4} exceeded ({:.4} spent)", max_cost, tally.cost);
                    tracing::warn!(parallel = %self.name, %reason, "Cancelling remaining branches");
                    abort = Some(reason);
                    stop.cancel();
                }
            }

            outcomes[index] = Some(outcome);
        }
        drop(pending);

        if abort.is_none() && cancel.is_cancelled() {
            abort = Some("cancelled".to_string());
        }

        let mut branches = BTreeMap::new();
        let mut required_failed = false;
        let mut optional_failed = false;

        for (branch, outcome) in self.branches.iter().zip(outcomes) {
            let record = match outcome {
                Some(Outcome::Ran(Ok(result))) => BranchResult::succeeded(&branch.name, branch.required, result),
                Some(Outcome::Ran(Err(ExecutionError::Cancelled { result: None }))) | Some(Outcome::NotStarted) | None => {
                    BranchResult::skipped(&branch.name, branch.required, Some("cancelled before start".into()))
                }
                Some(Outcome::Ran(Err(error))) => {
                    if branch.required {
                        required_failed = true;
                    } else {
                        optional_failed = true;
                    }
                    BranchResult::failed(&branch.name, branch.required, error.to_string(), failed_result(&error))
                }
            };
            branches.insert(branch.name.clone(), record);
        }

        let status = if abort.is_some() || required_failed {
            WorkflowStatus::Error
        } else if optional_failed && !self.tolerate_optional_failures {
            WorkflowStatus::Partial
        } else {
            WorkflowStatus::Success
        };

        let output = match &self.aggregator {
            Some(aggregate) => aggregate(&branches),
            None => Value::Object(
                branches
                    .iter()
                    .filter_map(|(name, b)| {
                        let result = b.result.as_ref()?;
                        serde_json::to_value(result).ok().map(|v| (name.clone(), v))
                    })
                    .collect(),
            ),
        };

        let error = abort.or_else(|| {
            required_failed.then(|| {
                let failed: Vec<&str> = branches
                    .values()
                    .filter(|b| b.required && b.failed)
                    .map(|b| b.name.as_str())
                    .collect();
                format!("required branches failed: {}", failed.join(", "))
            })
        });

        tally.finish(
            &self.name,
            WorkflowKind::Parallel,
            status,
            WorkflowChildren::Parallel { branches },
            output,
            error,
        )
    }
}

#[async_trait]
impl Executable for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        nested_outcome(self.run(ctx.nested(ctx.handoff()), cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ScriptedOutcome, ScriptedProvider};
    use crate::workflow::testing::{agent, executor};
    use relay_core::ErrorClass;

    fn broken(model: &str) -> ScriptedProvider {
        ScriptedProvider::new().script(
            model,
            [
                ScriptedOutcome::fail(ErrorClass::ServerError),
                ScriptedOutcome::fail(ErrorClass::ServerError),
            ],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_succeed() {
        let executor = executor(ScriptedProvider::new());
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("a", agent(&executor, "a")))
            .branch(ParallelBranch::new("b", agent(&executor, "b")));

        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.status, WorkflowStatus::Success);
        assert_eq!(run.output["a"]["chosen_model_id"], "a");
        assert_eq!(run.output["b"]["status"], "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_failure_is_partial_by_default() {
        let executor = executor(broken("b"));
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("a", agent(&executor, "a")))
            .branch(ParallelBranch::new("b", agent(&executor, "b")).optional());

        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.status, WorkflowStatus::Partial);
        assert!(run.branch("b").unwrap().failed);
        assert!(run.output.get("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_is_error() {
        let executor = executor(broken("b"));
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("a", agent(&executor, "a")))
            .branch(ParallelBranch::new("b", agent(&executor, "b")));

        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.status, WorkflowStatus::Error);
        assert!(run.branch("a").unwrap().is_success());
        assert!(run.error.unwrap().contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_skips_queued_branches() {
        let provider = ScriptedProvider::new()
            .script("bad", [ScriptedOutcome::fail(ErrorClass::InvalidRequest)])
            .latency(Duration::from_secs(1));
        let executor = executor(provider);
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("bad", agent(&executor, "bad")))
            .branch(ParallelBranch::new("queued", agent(&executor, "queued")))
            .concurrency(1)
            .fail_fast(true);

        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.status, WorkflowStatus::Error);
        assert!(run.branch("bad").unwrap().failed);
        let queued = run.branch("queued").unwrap();
        assert!(queued.skipped);
        assert!(!queued.failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_queues_branches() {
        let provider = ScriptedProvider::new().latency(Duration::from_secs(1));
        let executor = executor(provider);
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("a", agent(&executor, "a")))
            .branch(ParallelBranch::new("b", agent(&executor, "b")))
            .branch(ParallelBranch::new("c", agent(&executor, "c")))
            .branch(ParallelBranch::new("d", agent(&executor, "d")))
            .concurrency(2);

        let start = Instant::now();
        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.status, WorkflowStatus::Success);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_remaining() {
        let provider = ScriptedProvider::new().latency(Duration::from_secs(3));
        let executor = executor(provider);
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("a", agent(&executor, "a")))
            .branch(ParallelBranch::new("b", agent(&executor, "b")))
            .concurrency(1)
            .timeout(Duration::from_secs(2));

        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.status, WorkflowStatus::Error);
        assert!(run.error.as_ref().unwrap().contains("timeout"));
        assert!(run.branch("b").unwrap().skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_aggregation() {
        let executor = executor(
            ScriptedProvider::new()
                .script("a", [ScriptedOutcome::ok("x")])
                .script("b", [ScriptedOutcome::ok("y")]),
        );
        let parallel = Parallel::new("fan")
            .branch(ParallelBranch::new("a", agent(&executor, "a")))
            .branch(ParallelBranch::new("b", agent(&executor, "b")))
            .aggregate(|branches| {
                let joined: Vec<String> = branches
                    .values()
                    .filter_map(|b| b.result.as_ref()?.content.as_str().map(str::to_string))
                    .collect();
                Value::from(joined.join("+"))
            });

        let run = parallel.run(WorkflowContext::new(Value::Null), CancellationToken::new()).await;
        assert_eq!(run.output, Value::from("x+y"));
    }
}
