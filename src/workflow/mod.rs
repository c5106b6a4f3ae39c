//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, StepDefinition)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Pre-execution validation rules

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{
    ConditionOperator, ErrorHandling, ExecutionCondition, InputMapping, InputSource,
    LogicalOperator, OnError, OutputMapping, OutputTarget, StepDefinition, StepType,
    WorkflowConfig, WorkflowDefinition,
};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use validator::{quick_validate, validate_workflow, ValidationError};
