//! Shared handlers and helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use flowrunner::execution::interpolate;
use flowrunner::workflow::parse_workflow;
use flowrunner::{
    ActionError, ActionHandler, ActionRegistry, Engine, EngineConfig, ExecutionContext,
    StepResult, WorkflowDefinition,
};

/// Succeeds and reports how many times it has been called.
#[derive(Clone, Default)]
pub struct Counting {
    pub calls: Arc<AtomicUsize>,
}

impl Counting {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for Counting {
    async fn handle(
        &self,
        _config: &Value,
        _input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StepResult::success().with_output("calls", json!(call)))
    }
}

/// Always fails, either by returning a failed result or by raising.
#[derive(Clone, Default)]
pub struct Failing {
    pub calls: Arc<AtomicUsize>,
    pub raise: bool,
}

impl Failing {
    pub fn raising() -> Self {
        Self {
            raise: true,
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for Failing {
    async fn handle(
        &self,
        _config: &Value,
        _input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.raise {
            Err(ActionError::ExecutionFailed(format!("backend unavailable (call {})", call)))
        } else {
            Ok(StepResult::failure(format!("rejected (call {})", call)))
        }
    }
}

/// Returns `config.payload` as its result data.
pub struct Emit;

#[async_trait]
impl ActionHandler for Emit {
    async fn handle(
        &self,
        config: &Value,
        _input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let payload = config
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(StepResult::success().with_data(payload))
    }
}

/// Keeps the last input it was handed.
#[derive(Clone, Default)]
pub struct Capture {
    pub input: Arc<Mutex<Option<Map<String, Value>>>>,
}

impl Capture {
    pub fn last(&self) -> Option<Map<String, Value>> {
        self.input.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionHandler for Capture {
    async fn handle(
        &self,
        _config: &Value,
        input: &Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        *self.input.lock().unwrap() = Some(input.clone());
        Ok(StepResult::success())
    }
}

/// Renders `config.template` against the context, the way a notification
/// backend would before delivery.
pub struct Notify;

#[async_trait]
impl ActionHandler for Notify {
    async fn handle(
        &self,
        config: &Value,
        _input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, ActionError> {
        let template = config
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidConfig("template is required".into()))?;
        Ok(StepResult::success().with_output("message", json!(interpolate(template, ctx))))
    }

    fn supports_dry_run(&self) -> bool {
        true
    }
}

pub fn workflow(yaml: &str) -> WorkflowDefinition {
    parse_workflow(yaml).expect("test workflow parses")
}

pub fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Engine with the built-ins plus whatever `configure` registers, and fast
/// retries.
pub fn engine_with(configure: impl FnOnce(&mut ActionRegistry)) -> Engine {
    let mut actions = ActionRegistry::with_builtins();
    configure(&mut actions);
    let config = EngineConfig {
        default_retry_delay_ms: 5,
        ..Default::default()
    };
    Engine::new(config, actions)
}
