//! Provider Call abstraction.
//!
//! The executor never talks HTTP itself. It calls an [`LlmProvider`] with a
//! model id and an opaque payload, and gets back content plus token counts,
//! or a [`ProviderError`] carrying an [`ErrorClass`].
//!
//! ## Cancellation
//!
//! Every call receives a [`CancellationToken`]. Providers should stop early
//! when it fires, but this is best-effort: a request already on the wire
//! may still complete, and the executor treats its outcome as late.

use async_trait::async_trait;
use relay_core::{ErrorClass, TokenUsage};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod factory;
mod scripted;

pub use factory::{ProviderFactory, ProviderRegistry, ScriptedProviderFactory};
pub use scripted::{ScriptedOutcome, ScriptedProvider};

/// A failed provider call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{class}: {message}")]
pub struct ProviderError {
    /// Failure category
    pub class: ErrorClass,

    /// Provider message
    pub message: String,

    /// Provider's own opinion on retrying
    pub retryable_hint: Option<bool>,

    /// Minimum wait requested by the provider
    pub retry_after: Option<Duration>,

    /// Tokens billed despite the failure
    pub usage: Option<TokenUsage>,
}

impl ProviderError {
    /// Failure of a given class.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retryable_hint: None,
            retry_after: None,
            usage: None,
        }
    }

    /// Failure from an HTTP-like status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::from_status(status), message)
    }

    /// Rate limited, optionally with a Retry-After.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorClass::RateLimited, "rate limit exceeded")
        }
    }

    /// Call timed out.
    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorClass::Timeout, format!("timed out after {:?}", after))
    }

    /// Provider-side failure.
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ServerError, message)
    }

    /// Malformed request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InvalidRequest, message)
    }

    /// Attach the provider's retry hint.
    pub fn with_hint(mut self, retryable: bool) -> Self {
        self.retryable_hint = Some(retryable);
        self
    }

    /// Attach tokens billed for the failed call.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// A successful provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Generated content (opaque to the executor)
    pub content: Value,

    /// Token usage
    pub usage: TokenUsage,

    /// Cost reported by the provider; priced locally when absent
    pub cost: Option<f64>,
}

impl ProviderResponse {
    /// Response without a provider-reported cost.
    pub fn new(content: Value, usage: TokenUsage) -> Self {
        Self {
            content,
            usage,
            cost: None,
        }
    }
}

/// Provider abstraction allows swapping LLM backends.
///
/// This is the only place where model calls are made; the executor and the
/// workflow engine only ever go through it.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Call `model_id` with an opaque payload.
    async fn call(
        &self,
        model_id: &str,
        payload: &Value,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Check if provider is healthy.
    async fn health_check(&self) -> bool {
        true
    }

    /// Get provider name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(503, "down").class, ErrorClass::ServerError);
        assert_eq!(ProviderError::from_status(401, "key").class, ErrorClass::Authentication);
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::rate_limited(Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "rate_limited: rate limit exceeded");
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }
}
