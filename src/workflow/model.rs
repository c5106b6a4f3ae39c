//! Workflow Data Model
//!
//! Immutable description of a workflow: its ordered steps, their branching
//! conditions, variable mappings and error policies.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: low-stock-reorder
//! variables:
//!   threshold: 10
//! config:
//!   executionTimeout: 300
//!   onError: stop
//! steps:
//!   - id: check
//!     type: check-stock
//!     executionOrder: 1
//!     config:
//!       sku: WIDGET-1
//!
//!   - id: is_low
//!     type: condition
//!     executionOrder: 2
//!     config:
//!       conditions:
//!         - field: stock.available
//!           operator: less_than
//!           value: 10
//!       trueStepId: reorder
//!       falseStepId: done
//!
//!   - id: reorder
//!     type: create-purchase-order
//!     executionOrder: 3
//!     errorHandling:
//!       onError: retry
//!       maxRetries: 3
//!       retryDelayMs: 1000
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of the handler a step dispatches to.
///
/// The well-known business types are listed; anything else is carried as
/// [`StepType::Custom`] so handlers can be registered for new types without
/// touching the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Condition,
    Delay,
    CheckStock,
    CreateAdjustment,
    CreatePurchaseOrder,
    SendEmail,
    SendAlert,
    ApiCall,
    DataTransform,
    DataValidation,
    Parallel,
    Custom(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::CheckStock => "check-stock",
            Self::CreateAdjustment => "create-adjustment",
            Self::CreatePurchaseOrder => "create-purchase-order",
            Self::SendEmail => "send-email",
            Self::SendAlert => "send-alert",
            Self::ApiCall => "api-call",
            Self::DataTransform => "data-transform",
            Self::DataValidation => "data-validation",
            Self::Parallel => "parallel",
            Self::Custom(name) => name,
        }
    }

    /// Step types whose handlers act on systems outside the engine.
    pub fn business_types() -> [StepType; 6] {
        [
            Self::CheckStock,
            Self::CreateAdjustment,
            Self::CreatePurchaseOrder,
            Self::SendEmail,
            Self::SendAlert,
            Self::ApiCall,
        ]
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "condition" => Self::Condition,
            "delay" => Self::Delay,
            "check-stock" => Self::CheckStock,
            "create-adjustment" => Self::CreateAdjustment,
            "create-purchase-order" => Self::CreatePurchaseOrder,
            "send-email" => Self::SendEmail,
            "send-alert" => Self::SendAlert,
            "api-call" => Self::ApiCall,
            "data-transform" => Self::DataTransform,
            "data-validation" => Self::DataValidation,
            "parallel" => Self::Parallel,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for StepType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a step input field is read from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    WorkflowVariable,
    PreviousStep,
    StaticValue,
    UserInput,
}

/// Declares how one input field of a step is resolved.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputMapping {
    pub source: InputSource,

    /// Dotted path into the source; defaults to the field name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Value used when the path resolves to nothing (and the literal for `static_value`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default)]
    pub required: bool,
}

/// Where a step output field is written.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    WorkflowVariable,
    NextStep,
    WorkflowOutput,
}

/// Declares how one field of a step's result is stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputMapping {
    pub target: OutputTarget,

    /// Dotted destination path; defaults to the source field name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Reaction to a failed step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Retry,
    Skip,
    #[serde(alias = "goto")]
    GotoStep,
}

/// Per-step error policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    /// Falls back to the workflow's default action when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_step_id: Option<String>,
}

/// Comparison applied by a condition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    RegexMatch,
}

/// Joins a condition to the one after it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "&&")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "||")]
    Or,
}

/// A single `field operator value` test against context data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCondition {
    pub field: String,
    pub operator: ConditionOperator,

    #[serde(default)]
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_operator: Option<LogicalOperator>,
}

impl ExecutionCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logical_operator: None,
        }
    }

    /// Sets the operator joining this condition to the next one.
    pub fn then(mut self, operator: LogicalOperator) -> Self {
        self.logical_operator = Some(operator);
        self
    }
}

/// A single unit of work in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique identifier within the workflow
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Handler the step dispatches to
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Sort key; need not be contiguous, ties keep declaration order
    #[serde(default)]
    pub execution_order: i64,

    /// Type-specific configuration handed to the handler
    #[serde(default = "empty_object")]
    pub config: Value,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, InputMapping>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, OutputMapping>,

    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// All must hold (per the configured semantics) for the step to run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_conditions: Vec<ExecutionCondition>,

    #[serde(default)]
    pub is_critical: bool,

    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Step-level retry default, below `errorHandling.maxRetries`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Step-level delay default, below `errorHandling.retryDelayMs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_true() -> bool {
    true
}

impl StepDefinition {
    /// Creates an active step with empty configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::{OnError, StepDefinition, StepType};
    /// use serde_json::json;
    ///
    /// let step = StepDefinition::new("notify", StepType::SendEmail, 3)
    ///     .with_config(json!({ "to": "ops@example.com" }))
    ///     .on_error(OnError::Continue);
    /// assert_eq!(step.execution_order, 3);
    /// ```
    pub fn new(id: impl Into<String>, step_type: impl Into<StepType>, execution_order: i64) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: None,
            step_type: step_type.into(),
            execution_order,
            config: empty_object(),
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            error_handling: ErrorHandling::default(),
            execution_conditions: Vec::new(),
            is_critical: false,
            is_active: true,
            max_retries: None,
            retry_delay_ms: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, field: impl Into<String>, mapping: InputMapping) -> Self {
        self.input_mapping.insert(field.into(), mapping);
        self
    }

    pub fn with_output(mut self, field: impl Into<String>, mapping: OutputMapping) -> Self {
        self.output_mapping.insert(field.into(), mapping);
        self
    }

    pub fn with_condition(mut self, condition: ExecutionCondition) -> Self {
        self.execution_conditions.push(condition);
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    pub fn on_error(mut self, action: OnError) -> Self {
        self.error_handling.on_error = Some(action);
        self
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Reads a string field from the step config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Branch targets of a `condition` step.
    pub fn branch_targets(&self) -> (Option<&str>, Option<&str>) {
        (self.config_str("trueStepId"), self.config_str("falseStepId"))
    }

    /// Sub-steps fanned out by a `parallel` step.
    pub fn parallel_step_ids(&self) -> Vec<&str> {
        self.config
            .get("stepIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Every step ID this step may transfer control to.
    pub fn referenced_step_ids(&self) -> Vec<(&'static str, &str)> {
        let mut refs = Vec::new();
        if let Some(id) = self.error_handling.fallback_step_id.as_deref() {
            refs.push(("fallbackStepId", id));
        }
        if let Some(id) = self.error_handling.continue_step_id.as_deref() {
            refs.push(("continueStepId", id));
        }
        let (on_true, on_false) = self.branch_targets();
        if let Some(id) = on_true {
            refs.push(("trueStepId", id));
        }
        if let Some(id) = on_false {
            refs.push(("falseStepId", id));
        }
        for id in self.parallel_step_ids() {
            refs.push(("stepIds", id));
        }
        refs
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Workflow-wide execution policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Seconds before a running execution is aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_executions: Option<usize>,

    #[serde(default = "default_true")]
    pub allow_concurrent_execution: bool,

    /// Default action for steps without their own `onError`
    #[serde(default)]
    pub on_error: OnError,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            execution_timeout: None,
            max_concurrent_executions: None,
            allow_concurrent_execution: true,
            on_error: OnError::Stop,
        }
    }
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub steps: Vec<StepDefinition>,

    /// Seeds the execution's variables, overridden by caller input
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(default)]
    pub config: WorkflowConfig,
}

impl WorkflowDefinition {
    /// Creates an empty workflow.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps: Vec::new(),
            variables: Map::new(),
            config: WorkflowConfig::default(),
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let mut workflow = Self::new(id);
        workflow.steps = steps;
        workflow
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: StepDefinition) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps sorted by execution order, ties broken by declaration order.
    pub fn ordered_steps(&self) -> Vec<StepDefinition> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.execution_order);
        steps
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
