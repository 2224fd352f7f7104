//! Router: one upfront classification picks exactly one route.
//!
//! Strategies, in priority order:
//!
//! 1. **custom**: a function from input to route key; when set, nothing
//!    else is consulted
//! 2. **rule**: ordered `(predicate, route)` pairs, first match wins, no
//!    provider call
//! 3. **llm**: a classifier unit answering `{"route": .., "confidence": ..}`
//!
//! Whatever does not resolve to a declared route falls back to the default
//! route; without one the router fails with [`RouterError::NoRoute`].

use async_trait::async_trait;
use relay_core::{
    ExecutionResult, RouteDecision, RouteMethod, StepResult, WorkflowChildren, WorkflowExecution,
    WorkflowKind, WorkflowStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{failed_result, nested_outcome, Executable, Tally, WorkflowContext};
use crate::error::{ExecutionError, RouterError};

/// Rule predicate over the router input.
pub type RulePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Custom classification: input to route key.
pub type CustomRoute = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Rewrites the input for the chosen route: `(input, route key) -> input`.
pub type InputTransform = Arc<dyn Fn(&Value, &str) -> Value + Send + Sync>;

#[derive(Clone)]
struct Route {
    key: String,
    unit: Arc<dyn Executable>,
}

#[derive(Clone)]
struct Rule {
    predicate: RulePredicate,
    route: String,
}

/// What a classification produced before default resolution.
struct Classification {
    method: RouteMethod,
    route: Option<String>,
    confidence: Option<f64>,
    classifier_result: Option<ExecutionResult>,
    reason: Option<String>,
}

impl Classification {
    fn unresolved(method: RouteMethod, reason: impl Into<String>) -> Self {
        Self {
            method,
            route: None,
            confidence: None,
            classifier_result: None,
            reason: Some(reason.into()),
        }
    }
}

/// Picks one route per input and runs it.
#[derive(Clone)]
pub struct Router {
    name: String,
    routes: Vec<Route>,
    rules: Vec<Rule>,
    classifier: Option<Arc<dyn Executable>>,
    confidence_threshold: Option<f64>,
    custom: Option<CustomRoute>,
    default_route: Option<String>,
    transform: Option<InputTransform>,
}

impl Router {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            rules: Vec::new(),
            classifier: None,
            confidence_threshold: None,
            custom: None,
            default_route: None,
            transform: None,
        }
    }

    /// Declare a route.
    pub fn route(self, key: impl Into<String>, unit: impl Executable + 'static) -> Self {
        self.shared_route(key, Arc::new(unit))
    }

    pub fn shared_route(mut self, key: impl Into<String>, unit: Arc<dyn Executable>) -> Self {
        let key = key.into();
        self.routes.retain(|r| r.key != key);
        self.routes.push(Route { key, unit });
        self
    }

    /// Append a rule; rules are tried in the order added.
    pub fn rule<F>(mut self, predicate: F, route: impl Into<String>) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            predicate: Arc::new(predicate),
            route: route.into(),
        });
        self
    }

    /// Classify with a unit when no rule matches.
    ///
    /// The unit receives `{"input": <input>, "routes": [<keys>]}` and should
    /// answer `{"route": "<key>", "confidence": 0.0..1.0}` (as JSON or as a
    /// JSON string) or a bare route key.
    pub fn classifier(mut self, unit: impl Executable + 'static) -> Self {
        self.classifier = Some(Arc::new(unit));
        self
    }

    /// Classifier answers below this confidence go to the default route.
    ///
    /// May be set before or after [`Router::classifier`].
    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }

    /// Replace rules and classifier with a function.
    pub fn custom<F>(mut self, route: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(route));
        self
    }

    pub fn default_route(mut self, key: impl Into<String>) -> Self {
        self.default_route = Some(key.into());
        self
    }

    /// Rewrite the input once the route is chosen.
    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Value, &str) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared route keys, in declaration order.
    pub fn route_keys(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.key.as_str()).collect()
    }

    fn find(&self, key: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.key == key)
    }

    /// Check the static configuration.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.routes.is_empty() {
            return Err(RouterError::NoRoutes(self.name.clone()));
        }
        if let Some(default) = &self.default_route {
            if self.find(default).is_none() {
                return Err(RouterError::UndeclaredDefault {
                    router: self.name.clone(),
                    route: default.clone(),
                });
            }
        }
        Ok(())
    }

    /// Classify the input and run the chosen route.
    ///
    /// Route failures are reported in the returned execution; only
    /// configuration problems are errors.
    pub async fn run(
        &self,
        ctx: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution, RouterError> {
        match self.dispatch(ctx, cancel).await {
            (execution, None) => Ok(execution),
            (_, Some(error)) => Err(error),
        }
    }

    async fn dispatch(
        &self,
        ctx: WorkflowContext,
        cancel: CancellationToken,
    ) -> (WorkflowExecution, Option<RouterError>) {
        let mut tally = Tally::start();

        if let Err(error) = self.validate() {
            let execution = self.fail(tally, None, &error);
            return (execution, Some(error));
        }

        let input = ctx.input().clone();
        let classification = self.classify(&ctx, &input, cancel.clone()).await;
        if let Some(result) = &classification.classifier_result {
            tally.add_result(result);
        }

        let decision = match self.resolve(classification) {
            Ok(decision) => decision,
            Err((decision, error)) => {
                tracing::warn!(router = %self.name, error = %error, "No route resolved");
                let execution = self.fail(tally, decision, &error);
                return (execution, Some(error));
            }
        };

        let Some(route) = self.find(&decision.route_key) else {
            // resolve only returns declared keys
            let error = RouterError::NoRoute {
                router: self.name.clone(),
                reason: format!("route '{}' is not declared", decision.route_key),
            };
            let execution = self.fail(tally, Some(decision), &error);
            return (execution, Some(error));
        };

        tracing::debug!(
            router = %self.name,
            route = %decision.route_key,
            method = ?decision.method,
            confidence = ?decision.confidence,
            "Route chosen"
        );

        let routed_input = match &self.transform {
            Some(transform) => transform(&input, &route.key),
            None => input,
        };

        if cancel.is_cancelled() {
            let step = StepResult::skipped(&route.key, true, Some("cancelled".into()));
            let execution = tally.finish(
                &self.name,
                WorkflowKind::Router,
                WorkflowStatus::Error,
                WorkflowChildren::Router {
                    decision: Some(decision),
                    result: Some(step),
                },
                Value::Null,
                Some("cancelled".to_string()),
            );
            return (execution, None);
        }

        let outcome = route.unit.execute(&ctx.nested(routed_input), cancel).await;
        let (step, status, output, error) = match outcome {
            Ok(result) => {
                tally.add_result(&result);
                let output = result.content.clone();
                let status = if result.is_success() {
                    WorkflowStatus::Success
                } else {
                    WorkflowStatus::Error
                };
                (StepResult::succeeded(&route.key, true, result), status, output, None)
            }
            Err(error) => {
                tally.add_error(&error);
                let message = format!("route '{}' failed: {}", route.key, error);
                let step = StepResult::failed(&route.key, true, error.to_string(), failed_result(&error));
                (step, WorkflowStatus::Error, Value::Null, Some(message))
            }
        };

        let execution = tally.finish(
            &self.name,
            WorkflowKind::Router,
            status,
            WorkflowChildren::Router {
                decision: Some(decision),
                result: Some(step),
            },
            output,
            error,
        );
        tracing::info!(router = %self.name, status = ?execution.status, cost = execution.cost, "Router finished");
        (execution, None)
    }

    async fn classify(&self, ctx: &WorkflowContext, input: &Value, cancel: CancellationToken) -> Classification {
        if let Some(custom) = &self.custom {
            return match custom(input) {
                Some(route) => Classification {
                    method: RouteMethod::Custom,
                    route: Some(route),
                    confidence: None,
                    classifier_result: None,
                    reason: None,
                },
                None => Classification::unresolved(RouteMethod::Custom, "custom router returned no route"),
            };
        }

        if let Some(rule) = self.rules.iter().find(|rule| (rule.predicate)(input)) {
            return Classification {
                method: RouteMethod::Rule,
                route: Some(rule.route.clone()),
                confidence: None,
                classifier_result: None,
                reason: None,
            };
        }

        let Some(classifier) = &self.classifier else {
            return Classification::unresolved(RouteMethod::Rule, "no rule matched");
        };

        let prompt = json!({ "input": input, "routes": self.route_keys() });
        match classifier.execute(&ctx.nested(prompt), cancel).await {
            Ok(result) => {
                let (route, confidence) = parse_classification(&result.content);
                let mut classification = Classification {
                    method: RouteMethod::Llm,
                    route,
                    confidence,
                    classifier_result: Some(result),
                    reason: None,
                };
                match (classification.route.is_some(), confidence, self.confidence_threshold) {
                    (false, _, _) => {
                        classification.reason = Some("classifier answered no route".into());
                    }
                    (true, Some(confidence), Some(threshold)) if confidence < threshold => {
                        classification.route = None;
                        classification.reason = Some(format!(
                            "confidence {:.2} below threshold {:.2}",
                            confidence, threshold
                        ));
                    }
                    _ => {}
                }
                classification
            }
            Err(error) => {
                tracing::warn!(router = %self.name, error = %error, "Classifier failed, using default route");
                Classification {
                    method: RouteMethod::Llm,
                    route: None,
                    confidence: None,
                    classifier_result: failed_result(&error),
                    reason: Some(format!("classifier failed: {}", error)),
                }
            }
        }
    }

    /// Map a classification onto a declared route, falling back to the default.
    fn resolve(
        &self,
        classification: Classification,
    ) -> Result<RouteDecision, (Option<RouteDecision>, RouterError)> {
        let Classification {
            method,
            route,
            confidence,
            classifier_result,
            reason,
        } = classification;

        let reason = match route {
            Some(route) if self.find(&route).is_some() => {
                return Ok(RouteDecision {
                    route_key: route,
                    method,
                    confidence,
                    classifier_result,
                    fallback_reason: None,
                });
            }
            Some(route) => format!("route '{}' is not declared", route),
            None => reason.unwrap_or_else(|| "no route".to_string()),
        };

        match &self.default_route {
            Some(default) => Ok(RouteDecision {
                route_key: default.clone(),
                method: RouteMethod::Default,
                confidence,
                classifier_result,
                fallback_reason: Some(reason),
            }),
            None => {
                let decision = classifier_result.map(|result| RouteDecision {
                    route_key: String::new(),
                    method,
                    confidence,
                    classifier_result: Some(result),
                    fallback_reason: Some(reason.clone()),
                });
                Err((
                    decision,
                    RouterError::NoRoute {
                        router: self.name.clone(),
                        reason,
                    },
                ))
            }
        }
    }

    fn fail(&self, tally: Tally, decision: Option<RouteDecision>, error: &RouterError) -> WorkflowExecution {
        tally.finish(
            &self.name,
            WorkflowKind::Router,
            WorkflowStatus::Error,
            WorkflowChildren::Router { decision, result: None },
            Value::Null,
            Some(error.to_string()),
        )
    }
}

/// Read `(route, confidence)` out of a classifier answer.
fn parse_classification(content: &Value) -> (Option<String>, Option<f64>) {
    match content {
        Value::Object(map) => {
            let route = map.get("route").and_then(Value::as_str).map(|s| s.trim().to_string());
            let confidence = map.get("confidence").and_then(Value::as_f64);
            (route.filter(|r| !r.is_empty()), confidence)
        }
        Value::String(text) => {
            let text = text.trim();
            match serde_json::from_str::<Value>(text) {
                Ok(parsed @ Value::Object(_)) => parse_classification(&parsed),
                _ => {
                    let key = text.trim_matches('"');
                    ((!key.is_empty()).then(|| key.to_string()), None)
                }
            }
        }
        _ => (None, None),
    }
}

#[async_trait]
impl Executable for Router {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let (execution, _) = self.dispatch(ctx.nested(ctx.handoff()), cancel).await;
        nested_outcome(execution)
    }
}
