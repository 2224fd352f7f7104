//! Resilient call executor.
//!
//! Runs one [`ExecutionRequest`] across its fallback chain:
//!
//! ```text
//! reserve budget ──► for each candidate model (in order)
//!                      ├─ breaker open?  ──► skip
//!                      └─ attempts 0..=max_retries
//!                           ├─ cancelled / total_timeout passed ──► stop
//!                           ├─ top up hold for this model ──► denied: stop
//!                           ├─ provider call ──► commit spend
//!                           ├─ success ──► close breaker, return
//!                           ├─ non-retryable ──► breaker failure, next model
//!                           └─ retryable ──► backoff (or breaker failure
//!                                             after the last retry)
//! ```
//!
//! `total_timeout` is checked before each attempt, not during one: a call
//! already in flight runs to completion, so elapsed time may exceed the
//! timeout by up to one call's latency. Backoff waits stop at the deadline.

use chrono::Utc;
use relay_core::{
    AttemptRecord, ErrorClass, ExecutionRequest, ExecutionResult, ExecutionStatus, PricingTable,
    TokenUsage,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::providers::{LlmProvider, ProviderError, ProviderResponse};
use crate::resilience::{
    wall_clock, Admission, BreakerKey, BudgetLedger, CircuitBreaker, Reservation, Transition,
};
use crate::sinks::{AlertEvent, SinkDispatcher};

/// Executes resilient calls against one provider.
///
/// Cheap to clone; clones share breaker and ledger state.
#[derive(Clone)]
pub struct ResilientExecutor {
    provider: Arc<dyn LlmProvider>,
    breakers: Arc<CircuitBreaker>,
    ledger: Arc<BudgetLedger>,
    pricing: Arc<PricingTable>,
    sinks: SinkDispatcher,
}

/// Attempt history of one execution in progress.
struct Run<'a> {
    request: &'a ExecutionRequest,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
    attempts: Vec<AttemptRecord>,
    usage: TokenUsage,
    cost: f64,
    last_error: Option<ProviderError>,
}

impl<'a> Run<'a> {
    fn new(request: &'a ExecutionRequest) -> Self {
        Self {
            request,
            started_at: Utc::now(),
            clock: Instant::now(),
            attempts: Vec::new(),
            usage: TokenUsage::default(),
            cost: 0.0,
            last_error: None,
        }
    }

    fn record(&mut self, attempt: AttemptRecord) {
        self.usage.add(&attempt.usage);
        self.cost += attempt.cost;
        self.attempts.push(attempt);
    }

    fn finish(&self, status: ExecutionStatus, content: Value) -> ExecutionResult {
        let primary = self.request.primary_model().to_string();
        let chosen = self
            .attempts
            .last()
            .map(|a| a.model_id.clone())
            .unwrap_or_else(|| primary.clone());

        let (error_class, error_message) = match (status, &self.last_error) {
            (ExecutionStatus::Error, Some(err)) => (Some(err.class), Some(err.message.clone())),
            _ => (None, None),
        };

        ExecutionResult {
            agent: self.request.agent().to_string(),
            status,
            used_fallback: chosen != primary,
            primary_model_id: primary,
            chosen_model_id: chosen,
            attempts: self.attempts.clone(),
            usage: self.usage,
            cost: self.cost,
            content,
            tenant_id: self.request.tenant_id().map(str::to_string),
            started_at: self.started_at,
            duration: self.clock.elapsed(),
            error_class,
            error_message,
        }
    }
}

impl ResilientExecutor {
    /// Create an executor.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        breakers: Arc<CircuitBreaker>,
        ledger: Arc<BudgetLedger>,
        pricing: Arc<PricingTable>,
    ) -> Self {
        Self {
            provider,
            breakers,
            ledger,
            pricing,
            sinks: SinkDispatcher::new(),
        }
    }

    /// Use these sinks for executions and alerts.
    pub fn with_sinks(mut self, sinks: SinkDispatcher) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn breakers(&self) -> &Arc<CircuitBreaker> {
        &self.breakers
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn pricing(&self) -> &Arc<PricingTable> {
        &self.pricing
    }

    pub fn sinks(&self) -> &SinkDispatcher {
        &self.sinks
    }

    /// Execute a request, producing exactly one result or a typed error.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let agent = request.agent();
        let projected = relay_core::projected_cost(request, &self.pricing);

        let mut reservation = match self.ledger.reserve(&request.budget_scopes(), projected) {
            Ok(reservation) => reservation,
            Err(denial) => {
                tracing::warn!(agent, %denial, "Budget denied, no provider call made");
                self.sinks.alert(AlertEvent::budget_denied(&denial, agent));
                return Err(ExecutionError::BudgetExceeded {
                    agent: agent.to_string(),
                    denial,
                    result: None,
                });
            }
        };
        for warning in reservation.warnings() {
            self.sinks.alert(AlertEvent::budget_warning(warning, agent));
        }

        let outcome = self.run(request, &mut reservation, &cancel).await;
        drop(reservation);

        match &outcome {
            Ok(result) => self.sinks.log_execution(result),
            Err(err) => {
                if let Some(result) = err.result() {
                    self.sinks.log_execution(result);
                }
            }
        }
        outcome
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        reservation: &mut Reservation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let reliability = request.reliability();
        let settings = self.breakers.settings_for(request);
        let deadline = reliability.total_timeout.map(|t| (t, Instant::now() + t));
        let mut run = Run::new(request);
        let mut blocked: Option<Duration> = None;

        for model in request.models() {
            let key = BreakerKey::for_request(request, model, &settings);
            let admission = self.breakers.check(&key, &settings);
            if let Admission::Rejected { retry_after } = admission {
                tracing::debug!(circuit = %key, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, skipping model");
                blocked = Some(blocked.map_or(retry_after, |b| b.min(retry_after)));
                continue;
            }
            let trial = admission == Admission::Trial;

            for attempt_index in 0..=reliability.max_retries {
                if cancel.is_cancelled() {
                    return Err(ExecutionError::Cancelled {
                        result: self.partial(&run),
                    });
                }
                if let Some((timeout, at)) = deadline {
                    if Instant::now() > at {
                        tracing::warn!(agent = request.agent(), model = %model, ?timeout, "Total timeout exceeded");
                        return Err(ExecutionError::Timeout {
                            timeout,
                            result: Box::new(run.finish(ExecutionStatus::Error, Value::Null)),
                        });
                    }
                }
                let projected = relay_core::projected_cost_for(request, model, &self.pricing);
                match reservation.ensure(projected) {
                    Ok(warnings) => {
                        for warning in &warnings {
                            self.sinks.alert(AlertEvent::budget_warning(warning, request.agent()));
                        }
                    }
                    Err(denial) => {
                        tracing::warn!(agent = request.agent(), model = %model, %denial, "Budget denied next attempt");
                        self.sinks.alert(AlertEvent::budget_denied(&denial, request.agent()));
                        return Err(ExecutionError::BudgetExceeded {
                            agent: request.agent().to_string(),
                            denial,
                            result: self.partial(&run),
                        });
                    }
                }

                let started_at = Utc::now();
                let clock = Instant::now();
                let outcome = self
                    .provider
                    .call(model, request.payload(), cancel.child_token())
                    .await;
                let duration = clock.elapsed();
                let late = cancel.is_cancelled();

                match outcome {
                    Ok(response) => {
                        let ProviderResponse { content, usage, cost } = response;
                        let cost = cost.unwrap_or_else(|| self.pricing.cost(model, &usage));
                        self.commit(reservation, request, cost, &usage);
                        run.record(AttemptRecord {
                            model_id: model.clone(),
                            attempt_index,
                            started_at,
                            duration,
                            success: true,
                            error_kind: None,
                            error_message: None,
                            retryable: false,
                            usage,
                            cost,
                            late,
                        });

                        if let Some(Transition::Closed) = self.breakers.record_success(&key) {
                            self.sinks.alert(AlertEvent::breaker_closed(&key));
                        }

                        if late {
                            return Err(ExecutionError::Cancelled {
                                result: self.partial(&run),
                            });
                        }

                        if model != request.primary_model() {
                            tracing::info!(agent = request.agent(), primary = request.primary_model(), model = %model, "Served by fallback model");
                        }
                        return Ok(run.finish(ExecutionStatus::Success, content));
                    }
                    Err(error) => {
                        let usage = error.usage.unwrap_or_default();
                        let cost = if usage.is_empty() {
                            0.0
                        } else {
                            self.pricing.cost(model, &usage)
                        };
                        if !usage.is_empty() {
                            self.commit(reservation, request, cost, &usage);
                        }

                        let retryable = reliability.retry_on.is_retryable(
                            error.class,
                            &error.message,
                            error.retryable_hint,
                        );
                        tracing::debug!(
                            agent = request.agent(),
                            model = %model,
                            attempt = attempt_index,
                            error = %error,
                            retryable,
                            "Provider call failed"
                        );
                        run.record(AttemptRecord {
                            model_id: model.clone(),
                            attempt_index,
                            started_at,
                            duration,
                            success: false,
                            error_kind: Some(error.class),
                            error_message: Some(error.message.clone()),
                            retryable,
                            usage,
                            cost,
                            late,
                        });
                        let retry_after = error.retry_after;
                        run.last_error = Some(error);

                        if late {
                            return Err(ExecutionError::Cancelled {
                                result: self.partial(&run),
                            });
                        }

                        let last_try = attempt_index == reliability.max_retries;
                        if !retryable || last_try || trial {
                            self.report_failure(&key);
                            break;
                        }

                        let mut delay = reliability.backoff.delay(attempt_index);
                        if let Some(after) = retry_after {
                            delay = delay.max(after);
                        }
                        let mut pause = delay;
                        if let Some((_, at)) = deadline {
                            let left = at.saturating_duration_since(Instant::now());
                            pause = pause.min(left + Duration::from_millis(1));
                        }
                        tracing::debug!(
                            agent = request.agent(),
                            model = %model,
                            attempt = attempt_index,
                            delay_ms = delay.as_millis() as u64,
                            "Backing off before retry"
                        );

                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(ExecutionError::Cancelled { result: self.partial(&run) });
                            }
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
            }
        }

        if run.attempts.is_empty() {
            if let Some(retry_after) = blocked {
                tracing::warn!(agent = request.agent(), "Every candidate model has an open circuit");
                return Err(ExecutionError::CircuitOpen {
                    agent: request.agent().to_string(),
                    retry_after,
                    cooldown_until: wall_clock(Instant::now(), Instant::now() + retry_after),
                });
            }
        }

        let last_error = run.last_error.as_ref().map(|e| e.class);
        tracing::warn!(
            agent = request.agent(),
            attempts = run.attempts.len(),
            last_error = last_error.as_ref().map(ErrorClass::as_str).unwrap_or("none"),
            "All candidate models failed"
        );
        Err(ExecutionError::ExhaustedFallbacks {
            result: Box::new(run.finish(ExecutionStatus::Error, Value::Null)),
            last_error,
        })
    }

    fn partial(&self, run: &Run<'_>) -> Option<Box<ExecutionResult>> {
        if run.attempts.is_empty() {
            None
        } else {
            Some(Box::new(run.finish(ExecutionStatus::Error, Value::Null)))
        }
    }

    fn commit(&self, reservation: &mut Reservation, request: &ExecutionRequest, cost: f64, usage: &TokenUsage) {
        for warning in reservation.commit(cost, usage) {
            self.sinks.alert(AlertEvent::budget_warning(&warning, request.agent()));
        }
    }

    fn report_failure(&self, key: &BreakerKey) {
        let transition = self.breakers.record_failure(key);
        let (error_count, cooldown) = match transition {
            Some(Transition::Opened { error_count, cooldown }) => (error_count, cooldown),
            Some(Transition::Reopened { cooldown }) => {
                let count = self.breakers.status(key).map(|s| s.error_count).unwrap_or(0);
                (count, cooldown)
            }
            _ => return,
        };
        let now = Instant::now();
        self.sinks
            .alert(AlertEvent::breaker_open(key, error_count, wall_clock(now, now + cooldown)));
    }
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("provider", &self.provider.name())
            .field("sinks", &self.sinks)
            .finish()
    }
}
