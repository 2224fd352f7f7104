//! JSON Schema validation for configuration files.
//!
//! Configuration is validated against `schema/config.schema.json` before it
//! is deserialized, so structural mistakes (unknown keys, wrong types,
//! malformed durations) are reported with their location.

use jsonschema::Validator;
use serde_json::Value;
use std::sync::OnceLock;

const CONFIG_SCHEMA: &str = include_str!("../../schema/config.schema.json");

static VALIDATOR: OnceLock<Result<Validator, String>> = OnceLock::new();

/// The compiled schema; compiled on first use.
fn validator() -> Result<&'static Validator, String> {
    VALIDATOR
        .get_or_init(|| {
            let schema: Value = serde_json::from_str(CONFIG_SCHEMA)
                .map_err(|e| format!("embedded config schema is not JSON: {}", e))?;
            jsonschema::options()
                .build(&schema)
                .map_err(|e| format!("embedded config schema does not compile: {}", e))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Check a configuration document against the schema.
///
/// Every violation is reported as `"<message> at <path>"`.
pub fn validate_config_schema(config: &Value) -> Result<(), Vec<String>> {
    let validator = validator().map_err(|e| vec![e])?;
    let violations: Vec<String> = validator
        .iter_errors(config)
        .map(|error| format!("{} at {}", error, error.instance_path))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
