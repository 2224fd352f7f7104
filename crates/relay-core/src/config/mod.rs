//! Configuration loading and validation.
//!
//! Configuration is YAML or JSON, validated against an embedded JSON Schema
//! and then checked semantically. See [`RelayConfig`] for the layout.

mod parser;
mod schema;

pub use parser::{AgentConfig, BudgetConfig, BudgetLimits, ConfigError, RelayConfig};
pub use schema::validate_config_schema;
