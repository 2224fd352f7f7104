//! Deterministic provider that replays scripted outcomes.
//!
//! Each model has a queue of outcomes consumed one per call; once a queue is
//! empty the provider answers with its `otherwise` outcome. Useful for
//! dry runs of a configuration (`relay simulate`) and for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{ErrorClass, TokenUsage};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{LlmProvider, ProviderError, ProviderResponse};

/// One scripted reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// Succeed with this content and usage
    Ok { content: Value, usage: TokenUsage },
    /// Fail with this error
    Fail(ProviderError),
}

impl ScriptedOutcome {
    /// Success with default usage (100 in / 50 out).
    pub fn ok(content: impl Into<Value>) -> Self {
        ScriptedOutcome::Ok {
            content: content.into(),
            usage: TokenUsage::new(100, 50),
        }
    }

    /// Success with explicit usage.
    pub fn ok_with_usage(content: impl Into<Value>, usage: TokenUsage) -> Self {
        ScriptedOutcome::Ok {
            content: content.into(),
            usage,
        }
    }

    /// Failure of a class.
    pub fn fail(class: ErrorClass) -> Self {
        ScriptedOutcome::Fail(ProviderError::new(class, format!("scripted {}", class)))
    }

    /// Failure with a specific error.
    pub fn error(error: ProviderError) -> Self {
        ScriptedOutcome::Fail(error)
    }

    /// Parse `ok`, `ok:<text>`, `fail:<class>` or `fail:<class>:<message>`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let mut parts = text.splitn(3, ':');
        match parts.next() {
            Some("ok") => {
                let content = parts.collect::<Vec<_>>().join(":");
                let content = if content.is_empty() { "ok".to_string() } else { content };
                Ok(ScriptedOutcome::ok(content))
            }
            Some("fail") => {
                let class_name = parts.next().unwrap_or("server_error");
                let class = ErrorClass::parse(class_name)
                    .ok_or_else(|| format!("unknown error class '{}'", class_name))?;
                let outcome = match parts.next() {
                    Some(message) => ScriptedOutcome::Fail(ProviderError::new(class, message)),
                    None => ScriptedOutcome::fail(class),
                };
                Ok(outcome)
            }
            _ => Err(format!("invalid outcome '{}': expected ok[:text] or fail:<class>[:message]", text)),
        }
    }
}

/// Provider replaying per-model scripts.
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    otherwise: ScriptedOutcome,
    latency: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// Provider that succeeds for every model until scripted otherwise.
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            scripts: Mutex::new(HashMap::new()),
            otherwise: ScriptedOutcome::ok("ok"),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Set the provider name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue outcomes for a model.
    pub fn script<I>(self, model: impl Into<String>, outcomes: I) -> Self
    where
        I: IntoIterator<Item = ScriptedOutcome>,
    {
        self.scripts
            .lock()
            .entry(model.into())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Outcome once a model's script is exhausted.
    pub fn otherwise(mut self, outcome: ScriptedOutcome) -> Self {
        self.otherwise = outcome;
        self
    }

    /// Simulated latency of every call.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Models called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of calls made to one model.
    pub fn call_count(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == model).count()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn call(
        &self,
        model_id: &str,
        _payload: &Value,
        _cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().push(model_id.to_string());

        let outcome = self
            .scripts
            .lock()
            .get_mut(model_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.otherwise.clone());

        // In-flight calls are not interruptible
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match outcome {
            ScriptedOutcome::Ok { content, usage } => Ok(ProviderResponse::new(content, usage)),
            ScriptedOutcome::Fail(error) => Err(error),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
