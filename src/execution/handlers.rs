//! Built-in Step Handlers
//!
//! Handlers the engine ships with. Business step types (stock checks,
//! purchase orders, notifications, API calls) are backed by
//! [`UnavailableHandler`] until the embedding application registers a real
//! implementation.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::condition::{evaluate, evaluate_all, lookup};
use super::context::ExecutionContext;
use super::dispatch::{ActionError, ActionHandler, ActionRegistry, StepResult};
use super::mapper::{merge_into, set_path};
use crate::workflow::model::{ConditionOperator, ExecutionCondition, StepType};

/// Registers every built-in handler.
pub fn register_builtins(registry: &mut ActionRegistry) {
    registry
        .register(StepType::Condition, ConditionHandler)
        .register(StepType::Delay, DelayHandler)
        .register(StepType::DataTransform, DataTransformHandler)
        .register(StepType::DataValidation, DataValidationHandler);

    for step_type in StepType::business_types() {
        let handler = UnavailableHandler::new(step_type.clone());
        registry.register(step_type, handler);
    }
}

fn config_field<T: for<'de> Deserialize<'de>>(config: &Value, key: &str) -> Result<Option<T>, ActionError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| ActionError::InvalidConfig(format!("{}: {}", key, e))),
    }
}

/// Evaluates `config.conditions` and reports `data.result`.
pub struct ConditionHandler;

#[async_trait]
impl ActionHandler for ConditionHandler {
    async fn handle(
        &self,
        config: &Value,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let conditions: Vec<ExecutionCondition> =
            config_field(config, "conditions")?.unwrap_or_default();

        let mut data = match ctx.data() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merge_into(&mut data, input);

        let result = evaluate_all(
            &conditions,
            &Value::Object(data),
            ctx.system.condition_semantics,
        )?;
        debug!("Condition evaluated to {}", result);

        Ok(StepResult::success().with_output("result", Value::Bool(result)))
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Evaluates conditions and selects a branch"
    }
}

/// Suspends the execution for `config.delayMs` (or `config.seconds`).
pub struct DelayHandler;

impl DelayHandler {
    fn delay_of(config: &Value) -> Result<Duration, ActionError> {
        if let Some(ms) = config_field::<u64>(config, "delayMs")? {
            return Ok(Duration::from_millis(ms));
        }
        match config_field::<f64>(config, "seconds")? {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            Some(secs) => Err(ActionError::InvalidConfig(format!("invalid delay: {}", secs))),
            None => Ok(Duration::ZERO),
        }
    }
}

#[async_trait]
impl ActionHandler for DelayHandler {
    async fn handle(
        &self,
        config: &Value,
        _input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let delay = Self::delay_of(config)?;
        tokio::time::sleep(delay).await;
        Ok(StepResult::success().with_output("delayedMs", json!(delay.as_millis() as u64)))
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Waits for a fixed duration"
    }
}

/// One stage of a data-transform pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    Filter {
        field: String,
        operator: ConditionOperator,
        #[serde(default)]
        value: Value,
    },
    Sort {
        field: String,
        #[serde(default)]
        order: SortOrder,
    },
    Pick {
        fields: Vec<String>,
    },
    Aggregate {
        #[serde(default)]
        field: Option<String>,
        function: Aggregate,
    },
    Limit {
        count: usize,
    },
    Unique {
        #[serde(default)]
        field: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

fn field_of<'a>(item: &'a Value, field: Option<&str>) -> Option<&'a Value> {
    match field {
        Some(path) => lookup(item, path),
        None => Some(item),
    }
}

fn sort_key_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

impl Transform {
    /// Applies the stage. Every stage except `aggregate` keeps an array.
    pub fn apply(&self, value: Value) -> Result<Value, ActionError> {
        let Value::Array(items) = value else {
            return Err(ActionError::InvalidConfig(
                "data-transform stages expect an array".to_string(),
            ));
        };

        let out = match self {
            Self::Filter {
                field,
                operator,
                value,
            } => {
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    if evaluate(field, *operator, value, &item)? {
                        kept.push(item);
                    }
                }
                Value::Array(kept)
            }
            Self::Sort { field, order } => {
                let mut sorted = items;
                sorted.sort_by(|a, b| {
                    let ord = sort_key_cmp(lookup(a, field), lookup(b, field));
                    match order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    }
                });
                Value::Array(sorted)
            }
            Self::Pick { fields } => Value::Array(
                items
                    .iter()
                    .map(|item| {
                        let mut picked = Map::new();
                        for field in fields {
                            if let Some(v) = lookup(item, field) {
                                set_path(&mut picked, field, v.clone());
                            }
                        }
                        Value::Object(picked)
                    })
                    .collect(),
            ),
            Self::Aggregate { field, function } => {
                aggregate(&items, field.as_deref(), *function)
            }
            Self::Limit { count } => Value::Array(items.into_iter().take(*count).collect()),
            Self::Unique { field } => {
                let mut seen = HashSet::new();
                Value::Array(
                    items
                        .into_iter()
                        .filter(|item| {
                            let key = field_of(item, field.as_deref())
                                .map(Value::to_string)
                                .unwrap_or_default();
                            seen.insert(key)
                        })
                        .collect(),
                )
            }
        };

        Ok(out)
    }
}

fn aggregate(items: &[Value], field: Option<&str>, function: Aggregate) -> Value {
    if function == Aggregate::Count {
        let count = match field {
            Some(path) => items
                .iter()
                .filter(|item| !matches!(lookup(item, path), None | Some(Value::Null)))
                .count(),
            None => items.len(),
        };
        return json!(count);
    }

    let numbers: Vec<f64> = items
        .iter()
        .filter_map(|item| field_of(item, field))
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect();

    if numbers.is_empty() {
        return if function == Aggregate::Sum {
            json!(0)
        } else {
            Value::Null
        };
    }

    let result: f64 = match function {
        Aggregate::Sum => numbers.iter().sum(),
        Aggregate::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        Aggregate::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregate::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregate::Count => numbers.len() as f64,
    };
    json!(result)
}

/// Runs a closed set of named transforms over an array taken from the
/// step input.
///
/// ```yaml
/// type: data-transform
/// config:
///   source: orders
///   target: lowStock
///   transforms:
///     - { op: filter, field: available, operator: less_than, value: 5 }
///     - { op: sort, field: available }
///     - { op: pick, fields: [sku, available] }
/// ```
pub struct DataTransformHandler;

#[async_trait]
impl ActionHandler for DataTransformHandler {
    async fn handle(
        &self,
        config: &Value,
        input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let source: String = config_field(config, "source")?
            .ok_or_else(|| ActionError::InvalidConfig("source is required".to_string()))?;
        let target: String = config_field(config, "target")?.unwrap_or_else(|| "result".to_string());
        let transforms: Vec<Transform> = config_field(config, "transforms")?.unwrap_or_default();

        let input = Value::Object(input.clone());
        let mut value = lookup(&input, &source)
            .cloned()
            .ok_or_else(|| ActionError::ExecutionFailed(format!("source '{}' not found", source)))?;

        for transform in &transforms {
            value = transform.apply(value)?;
        }

        let mut data = Map::new();
        set_path(&mut data, &target, value);
        Ok(StepResult::success().with_data(data))
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Filters, sorts and aggregates data"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Required,
    Type,
    Min,
    Max,
    MinLength,
    MaxLength,
    Pattern,
    OneOf,
}

/// A single field rule for `data-validation` steps.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationRule {
    pub field: String,
    pub rule: RuleKind,
    #[serde(default)]
    pub value: Value,
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

impl ValidationRule {
    /// Returns a violation message, or `None` when the rule holds.
    pub fn check(&self, data: &Value) -> Result<Option<String>, ActionError> {
        let found = lookup(data, &self.field).filter(|v| !v.is_null());

        let Some(actual) = found else {
            return Ok((self.rule == RuleKind::Required)
                .then(|| format!("'{}' is required", self.field)));
        };

        let bad_rule = || {
            ActionError::InvalidConfig(format!(
                "rule {:?} on '{}' has invalid value {}",
                self.rule, self.field, self.value
            ))
        };

        let holds = match self.rule {
            RuleKind::Required => true,
            RuleKind::Type => json_type(actual) == self.value.as_str().ok_or_else(bad_rule)?,
            RuleKind::Min | RuleKind::Max => {
                let limit = self.value.as_f64().ok_or_else(bad_rule)?;
                match actual.as_f64() {
                    Some(n) if self.rule == RuleKind::Min => n >= limit,
                    Some(n) => n <= limit,
                    None => false,
                }
            }
            RuleKind::MinLength | RuleKind::MaxLength => {
                let limit = self.value.as_u64().ok_or_else(bad_rule)? as usize;
                match length_of(actual) {
                    Some(len) if self.rule == RuleKind::MinLength => len >= limit,
                    Some(len) => len <= limit,
                    None => false,
                }
            }
            RuleKind::Pattern => {
                let pattern = self.value.as_str().ok_or_else(bad_rule)?;
                let regex = Regex::new(pattern).map_err(|_| bad_rule())?;
                actual.as_str().is_some_and(|s| regex.is_match(s))
            }
            RuleKind::OneOf => self.value.as_array().ok_or_else(bad_rule)?.contains(actual),
        };

        Ok((!holds).then(|| {
            format!(
                "'{}' fails {:?} {}",
                self.field,
                self.rule,
                self.value
            )
        }))
    }
}

/// Checks the step input against `config.rules`.
///
/// Violations fail the step (without raising) unless `config.failOnInvalid`
/// is `false`, in which case they are only reported in `data.violations`.
pub struct DataValidationHandler;

#[async_trait]
impl ActionHandler for DataValidationHandler {
    async fn handle(
        &self,
        config: &Value,
        input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let rules: Vec<ValidationRule> = config_field(config, "rules")?.unwrap_or_default();
        let fail_on_invalid: bool = config_field(config, "failOnInvalid")?.unwrap_or(true);

        let data = Value::Object(input.clone());
        let mut violations = Vec::new();
        for rule in &rules {
            if let Some(violation) = rule.check(&data)? {
                violations.push(violation);
            }
        }

        let valid = violations.is_empty();
        let mut result = if valid || !fail_on_invalid {
            StepResult::success()
        } else {
            StepResult::failure(format!("validation failed: {}", violations.join("; ")))
        };
        result = result
            .with_output("valid", Value::Bool(valid))
            .with_output("violations", json!(violations));

        Ok(result)
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "Validates step input against field rules"
    }
}

/// Placeholder for a step type with no backend registered.
pub struct UnavailableHandler {
    step_type: StepType,
}

impl UnavailableHandler {
    pub fn new(step_type: StepType) -> Self {
        Self { step_type }
    }
}

#[async_trait]
impl ActionHandler for UnavailableHandler {
    async fn handle(
        &self,
        _config: &Value,
        _input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        Err(ActionError::Unavailable(self.step_type.clone()))
    }

    fn description(&self) -> &str {
        "No backend registered"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConditionSemantics;
    use crate::execution::context::ExecutionOptions;
    use crate::workflow::model::StepDefinition;
    use std::time::Instant;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            "e1",
            "wf",
            &json!({ "threshold": 5 }).as_object().cloned().unwrap(),
            Map::new(),
            &ExecutionOptions::default(),
            Duration::from_secs(5),
        )
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn orders() -> Map<String, Value> {
        object(json!({
            "orders": [
                { "sku": "A", "available": 9, "region": "eu" },
                { "sku": "B", "available": 2, "region": "us" },
                { "sku": "C", "available": 4, "region": "eu" },
                { "sku": "D", "region": "us" }
            ]
        }))
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ActionRegistry::with_builtins();
        assert!(registry.contains(&StepType::Condition));
        assert!(registry.contains(&StepType::DataValidation));
        assert!(registry.contains(&StepType::SendEmail));
        assert!(!registry.contains(&StepType::Parallel));
    }

    #[tokio::test]
    async fn test_condition_handler() {
        let config = json!({
            "conditions": [{ "field": "stock", "operator": "less_than", "value": 5 }]
        });
        let result = ConditionHandler
            .handle(&config, &object(json!({ "stock": 3 })), &context())
            .await
            .unwrap();
        assert_eq!(result.data["result"], true);

        let config = json!({
            "conditions": [{ "field": "threshold", "operator": "greater_than", "value": 10 }]
        });
        let result = ConditionHandler.handle(&config, &Map::new(), &context()).await.unwrap();
        assert_eq!(result.data["result"], false);
    }

    #[tokio::test]
    async fn test_condition_handler_uses_context_semantics() {
        let config = json!({
            "conditions": [
                { "field": "threshold", "operator": "equals", "value": 5, "logicalOperator": "OR" },
                { "field": "threshold", "operator": "equals", "value": 0, "logicalOperator": "AND" },
                { "field": "threshold", "operator": "equals", "value": 1 }
            ]
        });
        let mut ctx = context();
        let result = ConditionHandler.handle(&config, &Map::new(), &ctx).await.unwrap();
        assert_eq!(result.data["result"], true);

        ctx.system.condition_semantics = ConditionSemantics::LeftFold;
        let result = ConditionHandler.handle(&config, &Map::new(), &ctx).await.unwrap();
        assert_eq!(result.data["result"], false);
    }

    #[tokio::test]
    async fn test_delay_handler() {
        let start = Instant::now();
        let result = DelayHandler
            .handle(&json!({ "delayMs": 20 }), &Map::new(), &context())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(result.data["delayedMs"], 20);

        assert_eq!(
            DelayHandler::delay_of(&json!({ "seconds": 1.5 })).unwrap(),
            Duration::from_millis(1500)
        );
        assert!(DelayHandler::delay_of(&json!({ "seconds": -1 })).is_err());
    }

    #[tokio::test]
    async fn test_transform_pipeline() {
        let config = json!({
            "source": "orders",
            "target": "report.low",
            "transforms": [
                { "op": "filter", "field": "available", "operator": "less_than", "value": 5 },
                { "op": "sort", "field": "available", "order": "desc" },
                { "op": "pick", "fields": ["sku"] }
            ]
        });
        let result = DataTransformHandler
            .handle(&config, &orders(), &context())
            .await
            .unwrap();

        assert_eq!(result.data["report"]["low"], json!([{ "sku": "C" }, { "sku": "B" }]));
    }

    #[test]
    fn test_aggregates() {
        let items = orders()["orders"].clone();
        let run = |t: Transform| t.apply(items.clone()).unwrap();

        assert_eq!(
            run(Transform::Aggregate { field: Some("available".into()), function: Aggregate::Sum }),
            json!(15.0)
        );
        assert_eq!(
            run(Transform::Aggregate { field: Some("available".into()), function: Aggregate::Max }),
            json!(9.0)
        );
        assert_eq!(
            run(Transform::Aggregate { field: Some("available".into()), function: Aggregate::Count }),
            json!(3)
        );
        assert_eq!(
            run(Transform::Aggregate { field: None, function: Aggregate::Count }),
            json!(4)
        );
        assert_eq!(
            run(Transform::Aggregate { field: Some("nothing".into()), function: Aggregate::Avg }),
            Value::Null
        );
    }

    #[test]
    fn test_unique_and_limit() {
        let items = orders()["orders"].clone();

        let regions = Transform::Unique { field: Some("region".into()) }
            .apply(items.clone())
            .unwrap();
        assert_eq!(regions.as_array().unwrap().len(), 2);

        let limited = Transform::Limit { count: 1 }.apply(items).unwrap();
        assert_eq!(limited, json!([{ "sku": "A", "available": 9, "region": "eu" }]));
    }

    #[test]
    fn test_sort_missing_last() {
        let items = orders()["orders"].clone();
        let sorted = Transform::Sort { field: "available".into(), order: SortOrder::Asc }
            .apply(items)
            .unwrap();
        let skus: Vec<_> = sorted
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["sku"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(skus, vec!["B", "C", "A", "D"]);
    }

    #[tokio::test]
    async fn test_transform_errors() {
        let missing_source = DataTransformHandler
            .handle(&json!({ "source": "nope" }), &orders(), &context())
            .await;
        assert!(matches!(missing_source, Err(ActionError::ExecutionFailed(_))));

        let unknown_op = DataTransformHandler
            .handle(
                &json!({ "source": "orders", "transforms": [{ "op": "eval", "code": "1+1" }] }),
                &orders(),
                &context(),
            )
            .await;
        assert!(matches!(unknown_op, Err(ActionError::InvalidConfig(_))));

        let not_array = Transform::Limit { count: 1 }.apply(json!(3));
        assert!(not_array.is_err());
    }

    #[tokio::test]
    async fn test_validation_handler() {
        let config = json!({
            "rules": [
                { "field": "email", "rule": "required" },
                { "field": "email", "rule": "pattern", "value": "^[^@]+@[^@]+$" },
                { "field": "qty", "rule": "min", "value": 1 },
                { "field": "qty", "rule": "type", "value": "number" },
                { "field": "tier", "rule": "one_of", "value": ["gold", "silver"] },
                { "field": "name", "rule": "max_length", "value": 3 }
            ]
        });

        let good = object(json!({ "email": "a@b.c", "qty": 2, "tier": "gold", "name": "abc" }));
        let result = DataValidationHandler.handle(&config, &good, &context()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data["valid"], true);

        let bad = object(json!({ "qty": 0, "tier": "bronze", "name": "abcd" }));
        let result = DataValidationHandler.handle(&config, &bad, &context()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.data["violations"].as_array().unwrap().len(), 4);
        assert!(result.error_message().starts_with("validation failed"));
    }

    #[tokio::test]
    async fn test_validation_report_only() {
        let config = json!({
            "failOnInvalid": false,
            "rules": [{ "field": "email", "rule": "required" }]
        });
        let result = DataValidationHandler.handle(&config, &Map::new(), &context()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data["valid"], false);
    }

    #[tokio::test]
    async fn test_unavailable_raises_outside_dry_run() {
        let registry = ActionRegistry::with_builtins();
        let step = StepDefinition::new("po", StepType::CreatePurchaseOrder, 1);

        let outcome = registry.dispatch(&step, &Map::new(), &context()).await;
        assert!(outcome.raised);

        let dry = ExecutionContext::new(
            "e2",
            "wf",
            &Map::new(),
            Map::new(),
            &ExecutionOptions::dry_run(),
            Duration::from_secs(5),
        );
        let outcome = registry.dispatch(&step, &Map::new(), &dry).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.result.data["dryRun"], true);
    }
}
