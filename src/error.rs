//! Engine Error Types
//!
//! Errors surfaced to callers of the engine. Runtime failures of an
//! execution (a step failing, a timeout, a cancellation) are reported on the
//! [`ExecutionRecord`](crate::execution::ExecutionRecord) instead; the
//! variants here cover everything that prevents an execution from starting
//! or a lifecycle request from being honored.

use std::time::Duration;

use thiserror::Error;

use crate::execution::condition::ConditionError;
use crate::execution::record::ExecutionStatus;
use crate::execution::store::StoreError;
use crate::workflow::validator::ValidationError;

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow or one of its steps is malformed
    #[error("invalid workflow configuration: {}", join_messages(.0))]
    Configuration(Vec<ValidationError>),

    /// A condition could not be evaluated
    #[error("condition evaluation failed: {0}")]
    ConditionEvaluation(#[from] ConditionError),

    /// A step failed and its error policy aborted the execution
    #[error("step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    /// The execution ran longer than its configured timeout
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The execution was cancelled by an operator
    #[error("execution cancelled{}", .0.as_deref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Cancelled(Option<String>),

    /// No workflow with this ID is registered
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No in-flight execution with this ID
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// A lifecycle request is not valid from the execution's current status
    #[error("cannot {action} execution '{execution_id}' while {status}")]
    InvalidTransition {
        execution_id: String,
        action: &'static str,
        status: ExecutionStatus,
    },

    /// The workflow's concurrency bound has been reached
    #[error("workflow '{workflow_id}' already has {active} active execution(s) (limit {limit})")]
    ConcurrencyLimit {
        workflow_id: String,
        active: usize,
        limit: usize,
    },

    /// An execution with this ID is already in flight
    #[error("execution '{0}' is already running")]
    DuplicateExecution(String),

    /// The workflow definition could not be parsed
    #[error("failed to parse workflow: {0}")]
    Parse(String),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O error while loading definitions or configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable code recorded on failed executions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ConditionEvaluation(_) => "CONDITION_EVALUATION_ERROR",
            Self::StepExecution { .. } => "STEP_EXECUTION_ERROR",
            Self::Timeout(_) => "TIMEOUT_ERROR",
            Self::Cancelled(_) => "CANCELLATION_ERROR",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::DuplicateExecution(_) => "DUPLICATE_EXECUTION",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Timeout and cancellation are never retried or redirected by policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Timeout(_) | Self::Cancelled(_)
        )
    }
}

fn join_messages(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
