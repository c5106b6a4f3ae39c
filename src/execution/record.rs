//! Execution Records
//!
//! The persisted view of an execution: one [`ExecutionRecord`] per run,
//! updated as steps finish, and an append-only trail of
//! [`StepExecutionRecord`]s, one per attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::monitoring::ResourceUsage;
use crate::workflow::model::StepType;

/// Lifecycle status of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// True once the execution has left pending/running/paused.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single step attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Summary of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub tenant_id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,

    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub progress_percentage: f64,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,

    /// Execution data accumulated by the steps
    #[serde(default)]
    pub output: Map<String, Value>,

    /// Engine metrics (attempts, retries, peak memory)
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl ExecutionRecord {
    /// A fresh record in `pending`.
    pub fn new(
        tenant_id: impl Into<String>,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            current_step_id: None,
            total_steps,
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            progress_percentage: 0.0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            error_code: None,
            failed_step_id: None,
            output: Map::new(),
            metrics: Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Sum of completed, failed and skipped steps.
    pub fn accounted_steps(&self) -> usize {
        self.completed_steps + self.failed_steps + self.skipped_steps
    }

    /// Moves the record to a terminal status and stamps its end time.
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    /// Records the error summary of a failed, timed-out or cancelled run.
    pub fn set_error(
        &mut self,
        code: &str,
        message: impl Into<String>,
        failed_step_id: Option<String>,
    ) {
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.into());
        self.failed_step_id = failed_step_id;
    }
}

/// Audit entry for one step attempt. Never modified once written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionRecord {
    pub tenant_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,

    /// 0 for the first attempt, n for the n-th retry
    pub retry_count: u32,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,

    #[serde(default)]
    pub input: Map<String, Value>,

    #[serde(default)]
    pub output: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// The handler raised instead of returning a failed result
    #[serde(default)]
    pub raised: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}
