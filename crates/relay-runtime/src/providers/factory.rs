//! Named provider factories.
//!
//! A backend is plugged in by registering a [`ProviderFactory`] that builds
//! it from a JSON block; the executor only ever sees `Arc<dyn LlmProvider>`.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = ProviderRegistry::with_defaults();
//! let provider = registry.create("scripted", &serde_json::json!({
//!     "script": { "gpt-4o": ["fail:rate_limited", "ok"] }
//! }))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::ErrorClass;
use serde_json::Value as JsonValue;

use super::{LlmProvider, ProviderError, ScriptedOutcome, ScriptedProvider};

/// Builds one kind of provider from JSON.
pub trait ProviderFactory: Send + Sync {
    /// Key the factory is registered under.
    fn provider_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    /// Check a config block without building anything.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    fn description(&self) -> &'static str {
        "provider"
    }
}

/// Factories by provider type.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `scripted` factory.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ScriptedProviderFactory));
        registry
    }

    /// Register a provider factory, replacing one of the same type.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Build a provider of a registered type.
    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.factory(provider_type)?.create(config)
    }

    pub fn validate(&self, provider_type: &str, config: &JsonValue) -> Result<(), ProviderError> {
        self.factory(provider_type)?.validate_config(config)
    }

    /// Registered types, sorted.
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::new(
                ErrorClass::InvalidRequest,
                format!(
                    "no provider factory '{}' (registered: {})",
                    provider_type,
                    self.available_types().join(", ")
                ),
            )
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.available_types())
            .finish()
    }
}

/// Factory for [`ScriptedProvider`].
///
/// Config: `{"script": {"<model>": ["ok", "fail:<class>[:msg]"]},
/// "otherwise": "ok", "latency_ms": 0}`.
pub struct ScriptedProviderFactory;

impl ScriptedProviderFactory {
    fn invalid(message: String) -> ProviderError {
        ProviderError::new(ErrorClass::InvalidRequest, message)
    }

    fn parse_outcome(raw: &JsonValue) -> Result<ScriptedOutcome, ProviderError> {
        let text = raw
            .as_str()
            .ok_or_else(|| Self::invalid(format!("outcome must be a string, got {}", raw)))?;
        ScriptedOutcome::parse(text).map_err(Self::invalid)
    }

    fn build(config: &JsonValue) -> Result<ScriptedProvider, ProviderError> {
        let mut provider = ScriptedProvider::new();

        if let Some(script) = config.get("script") {
            let script = script
                .as_object()
                .ok_or_else(|| Self::invalid("script must be an object of model -> outcomes".into()))?;
            for (model, outcomes) in script {
                let outcomes = outcomes
                    .as_array()
                    .ok_or_else(|| Self::invalid(format!("script.{} must be a list", model)))?
                    .iter()
                    .map(Self::parse_outcome)
                    .collect::<Result<Vec<_>, _>>()?;
                provider = provider.script(model.clone(), outcomes);
            }
        }

        if let Some(otherwise) = config.get("otherwise") {
            provider = provider.otherwise(Self::parse_outcome(otherwise)?);
        }

        if let Some(ms) = config.get("latency_ms").and_then(|v| v.as_u64()) {
            provider = provider.latency(Duration::from_millis(ms));
        }

        if let Some(name) = config.get("name").and_then(|v| v.as_str()) {
            provider = provider.named(name);
        }

        Ok(provider)
    }
}

impl ProviderFactory for ScriptedProviderFactory {
    fn provider_type(&self) -> &'static str {
        "scripted"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(Self::build(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        Self::build(config).map(|_| ())
    }

    fn description(&self) -> &'static str {
        "Replays scripted outcomes per model"
    }
}
