//! Execution logger and alert sinks.
//!
//! Both are fire-and-forget: the [`SinkDispatcher`] delivers on tracked
//! background tasks, retries with backoff, and logs (never propagates)
//! delivery failures.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{BudgetPeriod, ExecutionResult, WorkflowExecution};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::error::SinkError;
use crate::resilience::{BreakerKey, BudgetDenial, BudgetWarning, WarningKind};

/// A named alert with its structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    BudgetSoftCap {
        scope: String,
        period: BudgetPeriod,
        limit: f64,
        current: f64,
        agent: String,
    },
    BudgetHardCap {
        scope: String,
        period: BudgetPeriod,
        limit: f64,
        current: f64,
        agent: String,
        /// The call was denied (hard enforcement)
        denied: bool,
    },
    BreakerOpen {
        agent: String,
        model: String,
        tenant: Option<String>,
        error_count: u32,
        cooldown_until: DateTime<Utc>,
    },
    BreakerClosed {
        agent: String,
        model: String,
        tenant: Option<String>,
    },
}

impl AlertEvent {
    /// Event name (`budget_soft_cap`, `breaker_open`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            AlertEvent::BudgetSoftCap { .. } => "budget_soft_cap",
            AlertEvent::BudgetHardCap { .. } => "budget_hard_cap",
            AlertEvent::BreakerOpen { .. } => "breaker_open",
            AlertEvent::BreakerClosed { .. } => "breaker_closed",
        }
    }

    pub fn budget_warning(warning: &BudgetWarning, agent: &str) -> Self {
        match warning.kind {
            WarningKind::SoftCap => AlertEvent::BudgetSoftCap {
                scope: warning.scope.to_string(),
                period: warning.period,
                limit: warning.limit,
                current: warning.current,
                agent: agent.to_string(),
            },
            WarningKind::OverLimit => AlertEvent::BudgetHardCap {
                scope: warning.scope.to_string(),
                period: warning.period,
                limit: warning.limit,
                current: warning.current,
                agent: agent.to_string(),
                denied: false,
            },
        }
    }

    pub fn budget_denied(denial: &BudgetDenial, agent: &str) -> Self {
        AlertEvent::BudgetHardCap {
            scope: denial.scope.to_string(),
            period: denial.period,
            limit: denial.limit,
            current: denial.current,
            agent: agent.to_string(),
            denied: true,
        }
    }

    pub fn breaker_open(key: &BreakerKey, error_count: u32, cooldown_until: DateTime<Utc>) -> Self {
        AlertEvent::BreakerOpen {
            agent: key.agent.clone(),
            model: key.model.clone(),
            tenant: key.tenant.clone(),
            error_count,
            cooldown_until,
        }
    }

    pub fn breaker_closed(key: &BreakerKey) -> Self {
        AlertEvent::BreakerClosed {
            agent: key.agent.clone(),
            model: key.model.clone(),
            tenant: key.tenant.clone(),
        }
    }
}

/// Receives every terminal execution and workflow run.
#[async_trait]
pub trait ExecutionLogger: Send + Sync {
    async fn log_execution(&self, result: &ExecutionResult) -> Result<(), SinkError>;

    async fn log_workflow(&self, execution: &WorkflowExecution) -> Result<(), SinkError>;

    fn name(&self) -> &str {
        "execution-logger"
    }
}

/// Receives alert events.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, event: &AlertEvent) -> Result<(), SinkError>;

    fn name(&self) -> &str {
        "alert-sink"
    }
}

/// Logs executions as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExecutionLogger;

#[async_trait]
impl ExecutionLogger for TracingExecutionLogger {
    async fn log_execution(&self, result: &ExecutionResult) -> Result<(), SinkError> {
        tracing::info!(
            agent = %result.agent,
            status = ?result.status,
            model = %result.chosen_model_id,
            used_fallback = result.used_fallback,
            attempts = result.attempts.len(),
            cost = result.cost,
            duration_ms = result.duration.as_millis() as u64,
            "Execution finished"
        );
        Ok(())
    }

    async fn log_workflow(&self, execution: &WorkflowExecution) -> Result<(), SinkError> {
        tracing::info!(
            workflow = %execution.name,
            workflow_id = %execution.workflow_id,
            kind = ?execution.kind,
            status = ?execution.status,
            cost = execution.cost,
            duration_ms = execution.duration.as_millis() as u64,
            "Workflow finished"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Logs alerts as `tracing` warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(event).map_err(|e| SinkError::new("tracing", e.to_string()))?;
        tracing::warn!(alert = event.name(), %payload, "Alert");
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// In-memory sink keeping everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    executions: Mutex<Vec<ExecutionResult>>,
    workflows: Mutex<Vec<WorkflowExecution>>,
    alerts: Mutex<Vec<AlertEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executions(&self) -> Vec<ExecutionResult> {
        self.executions.lock().clone()
    }

    pub fn workflows(&self) -> Vec<WorkflowExecution> {
        self.workflows.lock().clone()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().clone()
    }

    /// Names of the alerts received, in order.
    pub fn alert_names(&self) -> Vec<&'static str> {
        self.alerts.lock().iter().map(AlertEvent::name).collect()
    }
}

#[async_trait]
impl ExecutionLogger for RecordingSink {
    async fn log_execution(&self, result: &ExecutionResult) -> Result<(), SinkError> {
        self.executions.lock().push(result.clone());
        Ok(())
    }

    async fn log_workflow(&self, execution: &WorkflowExecution) -> Result<(), SinkError> {
        self.workflows.lock().push(execution.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn alert(&self, event: &AlertEvent) -> Result<(), SinkError> {
        self.alerts.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Fans out executions and alerts to the configured sinks.
#[derive(Clone)]
pub struct SinkDispatcher {
    loggers: Vec<Arc<dyn ExecutionLogger>>,
    alert_sinks: Vec<Arc<dyn AlertSink>>,
    tracker: TaskTracker,
    retry: ExponentialBuilder,
}

impl SinkDispatcher {
    /// Dispatcher with no sinks.
    pub fn new() -> Self {
        Self {
            loggers: Vec::new(),
            alert_sinks: Vec::new(),
            tracker: TaskTracker::new(),
            retry: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_secs(2))
                .with_max_times(3),
        }
    }

    /// Dispatcher with the tracing logger and alert sink.
    pub fn tracing() -> Self {
        Self::new()
            .with_logger(Arc::new(TracingExecutionLogger))
            .with_alert_sink(Arc::new(TracingAlertSink))
    }

    pub fn with_logger(mut self, logger: Arc<dyn ExecutionLogger>) -> Self {
        self.loggers.push(logger);
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sinks.push(sink);
        self
    }

    /// Retry policy for deliveries.
    pub fn with_retry(mut self, retry: ExponentialBuilder) -> Self {
        self.retry = retry;
        self
    }

    /// Deliver a terminal execution result.
    pub fn log_execution(&self, result: &ExecutionResult) {
        for logger in &self.loggers {
            let logger = logger.clone();
            let result = result.clone();
            let retry = self.retry.clone();
            self.tracker.spawn(async move {
                let delivered = (|| async { logger.log_execution(&result).await })
                    .retry(retry)
                    .notify(|err: &SinkError, after: Duration| {
                        tracing::debug!(error = %err, retry_in_ms = after.as_millis() as u64, "Retrying execution log delivery");
                    })
                    .await;
                if let Err(err) = delivered {
                    tracing::warn!(sink = logger.name(), error = %err, "Execution log delivery failed");
                }
            });
        }
    }

    /// Deliver a finished workflow run.
    pub fn log_workflow(&self, execution: &WorkflowExecution) {
        for logger in &self.loggers {
            let logger = logger.clone();
            let execution = execution.clone();
            let retry = self.retry.clone();
            self.tracker.spawn(async move {
                let delivered = (|| async { logger.log_workflow(&execution).await })
                    .retry(retry)
                    .await;
                if let Err(err) = delivered {
                    tracing::warn!(sink = logger.name(), error = %err, "Workflow log delivery failed");
                }
            });
        }
    }

    /// Deliver an alert.
    pub fn alert(&self, event: AlertEvent) {
        for sink in &self.alert_sinks {
            let sink = sink.clone();
            let event = event.clone();
            let retry = self.retry.clone();
            self.tracker.spawn(async move {
                let delivered = (|| async { sink.alert(&event).await })
                    .retry(retry)
                    .notify(|err: &SinkError, after: Duration| {
                        tracing::debug!(error = %err, retry_in_ms = after.as_millis() as u64, "Retrying alert delivery");
                    })
                    .await;
                if let Err(err) = delivered {
                    tracing::warn!(sink = sink.name(), alert = event.name(), error = %err, "Alert delivery failed");
                }
            });
        }
    }

    /// Wait for every delivery started so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Default for SinkDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SinkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkDispatcher")
            .field("loggers", &self.loggers.len())
            .field("alert_sinks", &self.alert_sinks.len())
            .field("pending", &self.tracker.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        failures_left: AtomicU32,
        delivered: AtomicU32,
    }

    #[async_trait]
    impl AlertSink for FlakySink {
        async fn alert(&self, _event: &AlertEvent) -> Result<(), SinkError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SinkError::new("flaky", "connection reset"));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn closed_event() -> AlertEvent {
        AlertEvent::breaker_closed(&BreakerKey::new("triage", "gpt-4o", None))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_is_retried() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(2),
            delivered: AtomicU32::new(0),
        });
        let dispatcher = SinkDispatcher::new().with_alert_sink(sink.clone());

        dispatcher.alert(closed_event());
        dispatcher.flush().await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_is_swallowed() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(100),
            delivered: AtomicU32::new(0),
        });
        let recording = Arc::new(RecordingSink::new());
        let dispatcher = SinkDispatcher::new()
            .with_alert_sink(sink.clone())
            .with_alert_sink(recording.clone());

        dispatcher.alert(closed_event());
        dispatcher.flush().await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(recording.alert_names(), vec!["breaker_closed"]);
    }

    #[test]
    fn test_alert_payload_shape() {
        let event = closed_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "breaker_closed");
        assert_eq!(json["model"], "gpt-4o");
    }
}
