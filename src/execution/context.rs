//! Execution Context
//!
//! Per-execution mutable state: variables, accumulated step outputs, the
//! caller's input, and the system/user context handed to handlers.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ConditionSemantics;
use crate::execution::mapper::merge_into;

/// Caller-supplied knobs for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    /// Handlers must not cause external side effects
    pub dry_run: bool,

    /// Overrides the workflow and engine timeouts
    #[serde(skip)]
    pub timeout: Option<Duration>,

    pub user_id: Option<String>,
    pub roles: Vec<String>,

    /// Partition key for persistence and events; `"default"` when unset
    pub tenant_id: Option<String>,

    pub debug: bool,
}

impl ExecutionOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Engine-owned settings for the execution.
#[derive(Debug, Clone)]
pub struct SystemContext {
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    pub dry_run: bool,
    pub debug: bool,
    pub condition_semantics: ConditionSemantics,
    started: Instant,
}

impl SystemContext {
    pub fn new(timeout: Duration, dry_run: bool, debug: bool) -> Self {
        Self {
            started_at: Utc::now(),
            timeout,
            dry_run,
            debug,
            condition_semantics: ConditionSemantics::default(),
            started: Instant::now(),
        }
    }

    /// Time since the execution started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the timeout, `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .checked_sub(self.elapsed())
            .filter(|d| !d.is_zero())
    }

    pub fn is_timed_out(&self) -> bool {
        self.elapsed() > self.timeout
    }
}

/// The acting user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: Option<String>,
    pub roles: Vec<String>,
}

/// Mutable state of one execution, threaded through every step.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: String,

    /// Seeded from workflow variables and caller input, updated by output mappings
    pub variables: Map<String, Value>,

    /// Step results visible to later steps
    pub execution_data: Map<String, Value>,

    /// The caller's input, unchanged; read by `user_input` mappings
    pub input_data: Map<String, Value>,

    pub system: SystemContext,
    pub user: UserContext,
}

impl ExecutionContext {
    /// Builds the context for a new execution. Caller input overrides
    /// workflow variables of the same name.
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_variables: &Map<String, Value>,
        input: Map<String, Value>,
        options: &ExecutionOptions,
        timeout: Duration,
    ) -> Self {
        let mut variables = workflow_variables.clone();
        merge_into(&mut variables, &input);

        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            tenant_id: options
                .tenant_id
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            variables,
            execution_data: Map::new(),
            input_data: input,
            system: SystemContext::new(timeout, options.dry_run, options.debug),
            user: UserContext {
                user_id: options.user_id.clone(),
                roles: options.roles.clone(),
            },
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.system.dry_run
    }

    /// Flattened view used by conditions: variables overlaid by step data.
    pub fn data(&self) -> Value {
        let mut merged = self.variables.clone();
        merge_into(&mut merged, &self.execution_data);
        Value::Object(merged)
    }
}
