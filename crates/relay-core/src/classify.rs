//! Retryable-error classification.
//!
//! Provider failures carry an [`ErrorClass`] plus a free-form message. A
//! [`RetryClassifier`] decides whether a failure is worth retrying against
//! the same model, using a small list of [`RetryRule`]s: either an error class
//! or a regex over the message.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    /// Network timeouts ("timed out", "deadline exceeded").
    pub static ref TIMEOUT_PATTERN: Regex = Regex::new(
        r"(?i)\b(timed?\s*out|timeout|deadline exceeded)\b"
    ).unwrap();

    /// Rate-limit signals (HTTP 429, "too many requests", "rate limit").
    pub static ref RATE_LIMIT_PATTERN: Regex = Regex::new(
        r"(?i)(\b429\b|too many requests|rate[\s_-]?limit)"
    ).unwrap();

    /// 5xx-equivalents (status codes, "overloaded", "service unavailable").
    pub static ref SERVER_ERROR_PATTERN: Regex = Regex::new(
        r"(?i)(\b5\d\d\b|overloaded|service unavailable|bad gateway|internal server error)"
    ).unwrap();

    /// Transport-level failures.
    pub static ref NETWORK_PATTERN: Regex = Regex::new(
        r"(?i)(connection (reset|refused|closed)|broken pipe|dns error)"
    ).unwrap();
}

/// Coarse category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The call did not complete in time
    Timeout,
    /// Provider throttled the call
    RateLimited,
    /// 5xx-equivalent failure on the provider side
    ServerError,
    /// Transport failure before a response arrived
    Network,
    /// Credentials rejected
    Authentication,
    /// The request itself is malformed or too large
    InvalidRequest,
    /// Output blocked by the provider's content filter
    ContentFiltered,
    /// Anything else
    Other,
}

impl ErrorClass {
    /// Snake-case name, as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Network => "network",
            ErrorClass::Authentication => "authentication",
            ErrorClass::InvalidRequest => "invalid_request",
            ErrorClass::ContentFiltered => "content_filtered",
            ErrorClass::Other => "other",
        }
    }

    /// Parse a snake-case name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "timeout" => ErrorClass::Timeout,
            "rate_limited" => ErrorClass::RateLimited,
            "server_error" => ErrorClass::ServerError,
            "network" => ErrorClass::Network,
            "authentication" => ErrorClass::Authentication,
            "invalid_request" => ErrorClass::InvalidRequest,
            "content_filtered" => ErrorClass::ContentFiltered,
            "other" => ErrorClass::Other,
            _ => return None,
        })
    }

    /// Map an HTTP-like status code to a class.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorClass::Timeout,
            429 => ErrorClass::RateLimited,
            401 | 403 => ErrorClass::Authentication,
            400 | 404 | 413 | 422 => ErrorClass::InvalidRequest,
            500..=599 => ErrorClass::ServerError,
            _ => ErrorClass::Other,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single retry rule.
///
/// Serialized as `{ class: rate_limited }` or `{ pattern: "(?i)overloaded" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RetryRuleSpec", into = "RetryRuleSpec")]
pub enum RetryRule {
    /// Retry failures of this class
    Class(ErrorClass),
    /// Retry failures whose message matches
    Pattern(Regex),
}

impl RetryRule {
    /// Build a pattern rule, validating the regex.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RetryRule::Pattern(Regex::new(pattern)?))
    }

    /// Whether the rule matches a failure.
    pub fn matches(&self, class: ErrorClass, message: &str) -> bool {
        match self {
            RetryRule::Class(c) => *c == class,
            RetryRule::Pattern(re) => re.is_match(message),
        }
    }
}

impl PartialEq for RetryRule {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RetryRule::Class(a), RetryRule::Class(b)) => a == b,
            (RetryRule::Pattern(a), RetryRule::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetryRuleSpec {
    Class { class: ErrorClass },
    Pattern { pattern: String },
}

impl TryFrom<RetryRuleSpec> for RetryRule {
    type Error = regex::Error;

    fn try_from(spec: RetryRuleSpec) -> Result<Self, Self::Error> {
        match spec {
            RetryRuleSpec::Class { class } => Ok(RetryRule::Class(class)),
            RetryRuleSpec::Pattern { pattern } => RetryRule::pattern(&pattern),
        }
    }
}

impl From<RetryRule> for RetryRuleSpec {
    fn from(rule: RetryRule) -> Self {
        match rule {
            RetryRule::Class(class) => RetryRuleSpec::Class { class },
            RetryRule::Pattern(re) => RetryRuleSpec::Pattern {
                pattern: re.as_str().to_string(),
            },
        }
    }
}

/// Decides whether a provider failure is retryable.
///
/// A failure is retryable when any rule matches. When no rule matches, the
/// provider's own hint is used; without a hint the failure is not retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryClassifier {
    rules: Vec<RetryRule>,
}

impl RetryClassifier {
    /// Classifier with an explicit rule list.
    pub fn new(rules: Vec<RetryRule>) -> Self {
        Self { rules }
    }

    /// Classifier that never retries on its own (only provider hints count).
    pub fn none() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: RetryRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Configured rules.
    pub fn rules(&self) -> &[RetryRule] {
        &self.rules
    }

    /// Classify a failure.
    pub fn is_retryable(&self, class: ErrorClass, message: &str, hint: Option<bool>) -> bool {
        if self.rules.iter().any(|r| r.matches(class, message)) {
            return true;
        }
        hint.unwrap_or(false)
    }
}

impl Default for RetryClassifier {
    /// Network timeouts, rate-limit signals and 5xx-equivalents.
    fn default() -> Self {
        Self {
            rules: vec![
                RetryRule::Class(ErrorClass::Timeout),
                RetryRule::Class(ErrorClass::RateLimited),
                RetryRule::Class(ErrorClass::ServerError),
                RetryRule::Class(ErrorClass::Network),
                RetryRule::Pattern(TIMEOUT_PATTERN.clone()),
                RetryRule::Pattern(RATE_LIMIT_PATTERN.clone()),
                RetryRule::Pattern(SERVER_ERROR_PATTERN.clone()),
                RetryRule::Pattern(NETWORK_PATTERN.clone()),
            ],
        }
    }
}

/// Best-effort class for an unstructured error message.
pub fn classify_message(message: &str) -> ErrorClass {
    if RATE_LIMIT_PATTERN.is_match(message) {
        ErrorClass::RateLimited
    } else if TIMEOUT_PATTERN.is_match(message) {
        ErrorClass::Timeout
    } else if SERVER_ERROR_PATTERN.is_match(message) {
        ErrorClass::ServerError
    } else if NETWORK_PATTERN.is_match(message) {
        ErrorClass::Network
    } else {
        ErrorClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retries_transient_classes() {
        let classifier = RetryClassifier::default();
        assert!(classifier.is_retryable(ErrorClass::RateLimited, "slow down", None));
        assert!(classifier.is_retryable(ErrorClass::ServerError, "", None));
        assert!(!classifier.is_retryable(ErrorClass::InvalidRequest, "bad json", None));
        assert!(!classifier.is_retryable(ErrorClass::Authentication, "bad key", None));
    }

    #[test]
    fn test_default_matches_messages() {
        let classifier = RetryClassifier::default();
        assert!(classifier.is_retryable(ErrorClass::Other, "upstream returned 503", None));
        assert!(classifier.is_retryable(ErrorClass::Other, "request timed out", None));
        assert!(classifier.is_retryable(ErrorClass::Other, "Too Many Requests", None));
        assert!(!classifier.is_retryable(ErrorClass::Other, "model not found", None));
    }

    #[test]
    fn test_hint_used_when_no_rule_matches() {
        let classifier = RetryClassifier::none();
        assert!(classifier.is_retryable(ErrorClass::Other, "x", Some(true)));
        assert!(!classifier.is_retryable(ErrorClass::Other, "x", None));
    }

    #[test]
    fn test_rules_from_yaml() {
        let yaml = "- class: rate_limited\n- pattern: \"(?i)overloaded\"\n";
        let classifier: RetryClassifier = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(classifier.rules().len(), 2);
        assert!(classifier.is_retryable(ErrorClass::Other, "Model is Overloaded", None));
        assert!(!classifier.is_retryable(ErrorClass::Timeout, "slow", None));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let yaml = "- pattern: \"(unclosed\"\n";
        assert!(serde_yaml::from_str::<RetryClassifier>(yaml).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorClass::from_status(429), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::from_status(502), ErrorClass::ServerError);
        assert_eq!(ErrorClass::from_status(400), ErrorClass::InvalidRequest);
        assert_eq!(classify_message("HTTP 429"), ErrorClass::RateLimited);
    }
}
