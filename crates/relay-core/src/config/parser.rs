//! Configuration parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::schema::validate_config_schema;
use crate::backoff::BackoffPolicy;
use crate::classify::RetryClassifier;
use crate::pricing::{ModelPrice, PricingTable};
use crate::types::{
    BreakerSettings, BudgetPeriod, BudgetScope, Enforcement, ExecutionRequest, ReliabilityConfig,
    RequestError,
};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),
}

/// Daily/monthly USD limits for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default)]
    pub daily: Option<f64>,

    #[serde(default)]
    pub monthly: Option<f64>,
}

impl BudgetLimits {
    /// Limit for a period.
    pub fn limit(&self, period: BudgetPeriod) -> Option<f64> {
        match period {
            BudgetPeriod::Daily => self.daily,
            BudgetPeriod::Monthly => self.monthly,
        }
    }
}

/// Budget section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// How limits are enforced
    #[serde(default)]
    pub enforcement: Enforcement,

    /// Early-warning threshold, as a percentage of each limit
    #[serde(default)]
    pub soft_cap_percentage: Option<f64>,

    /// Limits across all calls
    #[serde(default)]
    pub global: BudgetLimits,

    /// Limits per agent type
    #[serde(default)]
    pub agents: BTreeMap<String, BudgetLimits>,

    /// Limits per tenant
    #[serde(default)]
    pub tenants: BTreeMap<String, BudgetLimits>,

    /// Limits for tenants not listed in `tenants`
    #[serde(default)]
    pub tenant_default: Option<BudgetLimits>,
}

impl BudgetConfig {
    /// Config with hard enforcement and only global limits.
    pub fn hard_global(daily: Option<f64>, monthly: Option<f64>) -> Self {
        Self {
            enforcement: Enforcement::Hard,
            global: BudgetLimits { daily, monthly },
            ..Default::default()
        }
    }

    /// Limit for a (scope, period) pair, if one is configured.
    pub fn limit(&self, scope: &BudgetScope, period: BudgetPeriod) -> Option<f64> {
        match scope {
            BudgetScope::Global => self.global.limit(period),
            BudgetScope::Agent(name) => self.agents.get(name).and_then(|l| l.limit(period)),
            BudgetScope::Tenant(id) => self
                .tenants
                .get(id)
                .or(self.tenant_default.as_ref())
                .and_then(|l| l.limit(period)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(pct) = self.soft_cap_percentage {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(ConfigError::ValidationError(format!(
                    "budgets.soft_cap_percentage must be in (0, 100], got {}",
                    pct
                )));
            }
        }

        let all_limits = std::iter::once(("global".to_string(), &self.global))
            .chain(self.agents.iter().map(|(k, v)| (format!("agents.{}", k), v)))
            .chain(self.tenants.iter().map(|(k, v)| (format!("tenants.{}", k), v)))
            .chain(
                self.tenant_default
                    .iter()
                    .map(|v| ("tenant_default".to_string(), v)),
            );

        for (path, limits) in all_limits {
            for value in [limits.daily, limits.monthly].into_iter().flatten() {
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigError::ValidationError(format!(
                        "budgets.{} limits must be non-negative",
                        path
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Configuration of one agent.
///
/// Unset reliability fields inherit from the top-level `defaults`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Primary model
    pub model: String,

    /// Fallback chain, tried in order
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,

    #[serde(default, with = "crate::duration::human_opt")]
    pub total_timeout: Option<Duration>,

    #[serde(default)]
    pub retry_on: Option<RetryClassifier>,

    #[serde(default)]
    pub max_output_tokens: Option<u32>,

    /// Breaker override for this agent
    #[serde(default)]
    pub circuit_breaker: Option<BreakerSettings>,

    /// Fixed projected cost for budget checks
    #[serde(default)]
    pub projected_cost: Option<f64>,
}

impl AgentConfig {
    /// Agent with a primary model and no overrides.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fallback_models: Vec::new(),
            max_retries: None,
            backoff: None,
            total_timeout: None,
            retry_on: None,
            max_output_tokens: None,
            circuit_breaker: None,
            projected_cost: None,
        }
    }

    /// Overlay this agent's overrides on `defaults`.
    pub fn reliability(&self, defaults: &ReliabilityConfig) -> ReliabilityConfig {
        ReliabilityConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff: self.backoff.clone().unwrap_or_else(|| defaults.backoff.clone()),
            total_timeout: self.total_timeout.or(defaults.total_timeout),
            retry_on: self.retry_on.clone().unwrap_or_else(|| defaults.retry_on.clone()),
            max_output_tokens: self.max_output_tokens.unwrap_or(defaults.max_output_tokens),
        }
    }

    /// Build a request for this agent.
    pub fn request(
        &self,
        name: &str,
        defaults: &ReliabilityConfig,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<ExecutionRequest, RequestError> {
        let mut builder = ExecutionRequest::builder(name, self.model.clone())
            .fallbacks(self.fallback_models.iter().cloned())
            .reliability(self.reliability(defaults))
            .payload(payload);

        if let Some(settings) = &self.circuit_breaker {
            builder = builder.circuit_breaker(settings.clone());
        }
        if let Some(tenant) = tenant_id {
            builder = builder.tenant(tenant);
        }
        if let Some(cost) = self.projected_cost {
            builder = builder.projected_cost(cost);
        }

        builder.build()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Reliability defaults for every agent
    #[serde(default)]
    pub defaults: ReliabilityConfig,

    /// Default breaker thresholds
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    /// Spend limits
    #[serde(default)]
    pub budgets: BudgetConfig,

    /// Price overrides, merged over the built-in table
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelPrice>,

    /// Agents by name
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl RelayConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse configuration from a file; `.json` files are read as JSON,
    /// everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        // An empty YAML document parses to null
        let value = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value
        };

        validate_config_schema(&value).map_err(ConfigError::SchemaError)?;
        let config: RelayConfig = serde_json::from_value(value)?;
        config.validate()?;
        tracing::debug!(agents = config.agents.len(), "Loaded relay config");
        Ok(config)
    }

    /// Semantic checks the schema cannot express.
    fn validate(&self) -> Result<(), ConfigError> {
        self.budgets.validate()?;

        for (name, agent) in &self.agents {
            let mut seen = std::collections::HashSet::new();
            for model in std::iter::once(&agent.model).chain(agent.fallback_models.iter()) {
                if !seen.insert(model) {
                    return Err(ConfigError::ValidationError(format!(
                        "agents.{}: model '{}' listed more than once",
                        name, model
                    )));
                }
            }

            let backoff = agent.backoff.as_ref().unwrap_or(&self.defaults.backoff);
            if backoff.max_delay < backoff.base {
                return Err(ConfigError::ValidationError(format!(
                    "agents.{}: backoff.max_delay is shorter than backoff.base",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Look up an agent.
    pub fn agent(&self, name: &str) -> Result<&AgentConfig, ConfigError> {
        self.agents
            .get(name)
            .ok_or_else(|| ConfigError::UnknownAgent(name.to_string()))
    }

    /// Build a request for a configured agent.
    pub fn request(
        &self,
        agent: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> Result<ExecutionRequest, ConfigError> {
        let config = self.agent(agent)?;
        Ok(config.request(agent, &self.defaults, payload, tenant_id)?)
    }

    /// Pricing table with this config's overrides applied.
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::default();
        table.merge(&self.pricing);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffKind;

    const VALID_CONFIG: &str = r#"
defaults:
  max_retries: 2
  backoff:
    kind: exponential
    base: 500ms
    max_delay: 30s
  total_timeout: 60s
circuit_breaker:
  errors: 3
  within: 60s
  cooldown: 5m
budgets:
  enforcement: hard
  soft_cap_percentage: 80
  global:
    daily: 10.0
  agents:
    summarizer:
      monthly: 50.0
  tenant_default:
    daily: 1.0
pricing:
  in-house-7b:
    input: 0.1
    output: 0.2
agents:
  summarizer:
    model: gpt-4o
    fallback_models: [gpt-4o-mini]
    max_retries: 3
  classifier:
    model: claude-haiku-4-5
    backoff:
      kind: constant
      base: 1s
      max_delay: 1s
    retry_on:
      - class: rate_limited
"#;

    #[test]
    fn test_parse_valid_config() {
        let config = RelayConfig::from_yaml(VALID_CONFIG).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.circuit_breaker.errors, 3);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(300));
        assert_eq!(config.budgets.enforcement, Enforcement::Hard);
    }

    #[test]
    fn test_agent_inherits_defaults() {
        let config = RelayConfig::from_yaml(VALID_CONFIG).unwrap();

        let summarizer = config.request("summarizer", Value::Null, None).unwrap();
        assert_eq!(summarizer.models(), &["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(summarizer.reliability().max_retries, 3);
        assert_eq!(summarizer.reliability().total_timeout, Some(Duration::from_secs(60)));

        let classifier = config.request("classifier", Value::Null, Some("acme")).unwrap();
        assert_eq!(classifier.reliability().max_retries, 2);
        assert_eq!(classifier.reliability().backoff.kind, BackoffKind::Constant);
        assert_eq!(classifier.reliability().retry_on.rules().len(), 1);
        assert_eq!(classifier.tenant_id(), Some("acme"));
    }

    #[test]
    fn test_budget_limit_lookup() {
        let config = RelayConfig::from_yaml(VALID_CONFIG).unwrap();
        let budgets = &config.budgets;

        assert_eq!(budgets.limit(&BudgetScope::Global, BudgetPeriod::Daily), Some(10.0));
        assert_eq!(budgets.limit(&BudgetScope::Global, BudgetPeriod::Monthly), None);
        assert_eq!(
            budgets.limit(&BudgetScope::Agent("summarizer".into()), BudgetPeriod::Monthly),
            Some(50.0)
        );
        assert_eq!(
            budgets.limit(&BudgetScope::Tenant("anyone".into()), BudgetPeriod::Daily),
            Some(1.0)
        );
    }

    #[test]
    fn test_pricing_overrides_merge() {
        let config = RelayConfig::from_yaml(VALID_CONFIG).unwrap();
        let table = config.pricing_table();
        assert_eq!(table.price("in-house-7b"), ModelPrice::new(0.1, 0.2));
        assert_eq!(table.price("gpt-4o"), ModelPrice::new(2.5, 10.0));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = RelayConfig::from_yaml("").unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.budgets.enforcement, Enforcement::None);
    }

    #[test]
    fn test_duplicate_fallback_rejected() {
        let yaml = r#"
agents:
  a:
    model: gpt-4o
    fallback_models: [gpt-4o]
"#;
        assert!(matches!(
            RelayConfig::from_yaml(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_schema_violation_reported() {
        let yaml = r#"
agents:
  a:
    modle: gpt-4o
"#;
        assert!(matches!(
            RelayConfig::from_yaml(yaml),
            Err(ConfigError::SchemaError(_))
        ));
    }

    #[test]
    fn test_unknown_agent() {
        let config = RelayConfig::from_yaml(VALID_CONFIG).unwrap();
        assert!(matches!(
            config.request("nope", Value::Null, None),
            Err(ConfigError::UnknownAgent(_))
        ));
    }
}
