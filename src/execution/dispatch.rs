//! Action Dispatch Table
//!
//! Maps step types to the handlers that perform them. Every handler outcome,
//! whether a returned result, a raised error or a missing handler, is
//! normalized into a [`DispatchOutcome`] so the policy engine sees one shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::condition::ConditionError;
use super::context::ExecutionContext;
use crate::monitoring::ResourceUsage;
use crate::workflow::model::{StepDefinition, StepType};

/// Errors a handler raises instead of returning a failed result.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid step configuration: {0}")]
    InvalidConfig(String),

    #[error("no handler available for step type '{0}'")]
    Unavailable(StepType),

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// What a handler reports back for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,

    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Relocates the cursor after a successful step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,

    /// Ends the execution early with partial success
    #[serde(default)]
    pub skip_remaining_steps: bool,

    /// Overrides the delay before the next retry attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_next_step(mut self, step_id: impl Into<String>) -> Self {
        self.next_step_id = Some(step_id.into());
        self
    }

    pub fn skip_remaining(mut self) -> Self {
        self.skip_remaining_steps = true;
        self
    }

    pub fn retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// The error message, or a generic one when the handler gave none.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "step reported failure".to_string())
    }
}

/// Contract every step handler satisfies.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use flowrunner::execution::{ActionError, ActionHandler, ExecutionContext, StepResult};
/// use serde_json::{json, Map, Value};
///
/// struct CheckStock;
///
/// #[async_trait]
/// impl ActionHandler for CheckStock {
///     async fn handle(
///         &self,
///         config: &Value,
///         _input: &Map<String, Value>,
///         _ctx: &ExecutionContext,
///     ) -> Result<StepResult, ActionError> {
///         let sku = config.get("sku").cloned().unwrap_or(Value::Null);
///         Ok(StepResult::success().with_output("stock", json!({ "sku": sku, "available": 4 })))
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Performs the step.
    async fn handle(
        &self,
        config: &Value,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError>;

    /// When true the handler is called in dry-run mode and must avoid side
    /// effects itself; otherwise dispatch simulates success without calling it.
    fn supports_dry_run(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        ""
    }
}

/// A normalized handler outcome.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: StepResult,

    /// The handler raised (or was missing) rather than returning a result
    pub raised: bool,

    pub duration: Duration,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.success
    }
}

/// Registry of handlers keyed by step type.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<StepType, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::handlers::register_builtins(&mut registry);
        registry
    }

    /// Registers a handler, replacing any previous one for the type.
    pub fn register<H: ActionHandler + 'static>(
        &mut self,
        step_type: impl Into<StepType>,
        handler: H,
    ) -> &mut Self {
        self.handlers.insert(step_type.into(), Arc::new(handler));
        self
    }

    /// Registers a shared handler.
    pub fn register_arc(
        &mut self,
        step_type: impl Into<StepType>,
        handler: Arc<dyn ActionHandler>,
    ) -> &mut Self {
        self.handlers.insert(step_type.into(), handler);
        self
    }

    pub fn get(&self, step_type: &StepType) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(step_type)
    }

    pub fn contains(&self, step_type: &StepType) -> bool {
        self.handlers.contains_key(step_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invokes the handler for `step`, normalizing the outcome.
    pub async fn dispatch(
        &self,
        step: &StepDefinition,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> DispatchOutcome {
        let start = Instant::now();

        let Some(handler) = self.handlers.get(&step.step_type) else {
            return DispatchOutcome {
                result: StepResult::failure(ActionError::Unavailable(step.step_type.clone()).to_string()),
                raised: true,
                duration: start.elapsed(),
            };
        };

        if ctx.is_dry_run() && !handler.supports_dry_run() {
            debug!("[DRY RUN] Step '{}' ({}) simulated", step.id, step.step_type);
            return DispatchOutcome {
                result: StepResult::success()
                    .with_output("dryRun", Value::Bool(true))
                    .with_output("stepType", json!(step.step_type.as_str()))
                    .with_output("inputKeys", json!(input.keys().collect::<Vec<_>>())),
                raised: false,
                duration: start.elapsed(),
            };
        }

        let (result, raised) = match handler.handle(&step.config, input, ctx).await {
            Ok(result) => (result, false),
            Err(e) => (StepResult::failure(e.to_string()), true),
        };

        DispatchOutcome {
            result,
            raised,
            duration: start.elapsed(),
        }
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(StepType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ActionRegistry").field("handlers", &types).finish()
    }
}
