//! Workflow Validation
//!
//! Everything that can be known to be wrong about a definition is rejected
//! here, before an execution starts:
//! - Step field validation
//! - Reference integrity (fallback/continue/branch/parallel targets)
//! - Error policy completeness
//! - Condition syntax (operators are typed; regex patterns must compile)

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::model::{
    ConditionOperator, ExecutionCondition, OnError, StepDefinition, StepType, WorkflowDefinition,
};
use crate::error::{EngineError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Workflow has an empty ID")]
    EmptyWorkflowId,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Step '{step}' references unknown step '{reference}' in {field}")]
    InvalidReference {
        step: String,
        field: &'static str,
        reference: String,
    },

    #[error("Step '{0}' uses onError goto_step but has no fallbackStepId")]
    MissingFallback(String),

    #[error("Step '{step}' has invalid config: {message}")]
    InvalidStepConfig { step: String, message: String },

    #[error("Step '{0}' has a condition with an empty field path")]
    EmptyConditionField(String),

    #[error("Step '{step}' has an invalid regex pattern '{pattern}'")]
    InvalidPattern { step: String, pattern: String },

    #[error("Parallel step '{0}' lists itself as a sub-step")]
    ParallelSelfReference(String),

    #[error("Step '{step}' routes to '{reference}' in {field}, which only runs inside parallel step '{owner}'")]
    OwnedStepTarget {
        step: String,
        field: &'static str,
        reference: String,
        owner: String,
    },
}

/// Validates a single step's fields, independent of its siblings.
fn validate_step(step: &StepDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors;
    }

    if step.error_handling.on_error == Some(OnError::GotoStep)
        && step.error_handling.fallback_step_id.is_none()
    {
        errors.push(ValidationError::MissingFallback(step.id.clone()));
    }

    errors.extend(validate_conditions(&step.id, &step.execution_conditions));

    match &step.step_type {
        StepType::Condition => match step.config.get("conditions") {
            Some(raw) => match serde_json::from_value::<Vec<ExecutionCondition>>(raw.clone()) {
                Ok(conditions) => errors.extend(validate_conditions(&step.id, &conditions)),
                Err(e) => errors.push(ValidationError::InvalidStepConfig {
                    step: step.id.clone(),
                    message: format!("conditions: {}", e),
                }),
            },
            None => errors.push(ValidationError::InvalidStepConfig {
                step: step.id.clone(),
                message: "condition step requires a 'conditions' list".to_string(),
            }),
        },
        StepType::Parallel => {
            let ids = step.parallel_step_ids();
            if ids.is_empty() {
                errors.push(ValidationError::InvalidStepConfig {
                    step: step.id.clone(),
                    message: "parallel step requires a non-empty 'stepIds' list".to_string(),
                });
            }
            if ids.contains(&step.id.as_str()) {
                errors.push(ValidationError::ParallelSelfReference(step.id.clone()));
            }
        }
        _ => {}
    }

    if !step.config.is_object() && !step.config.is_null() {
        errors.push(ValidationError::InvalidStepConfig {
            step: step.id.clone(),
            message: "config must be an object".to_string(),
        });
    }

    if !step.is_active {
        debug!("Step '{}' is inactive and will be skipped", step.id);
    }

    errors
}

fn validate_conditions(step_id: &str, conditions: &[ExecutionCondition]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for condition in conditions {
        if condition.field.trim().is_empty() {
            errors.push(ValidationError::EmptyConditionField(step_id.to_string()));
        }
        if condition.operator == ConditionOperator::RegexMatch {
            if let Value::String(pattern) = &condition.value {
                if Regex::new(pattern).is_err() {
                    errors.push(ValidationError::InvalidPattern {
                        step: step_id.to_string(),
                        pattern: pattern.clone(),
                    });
                }
            }
        }
    }
    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. Workflow has an ID and at least one step
/// 2. No duplicate step IDs
/// 3. All steps have valid fields and complete error policies
/// 4. All control-flow references point to existing steps
///
/// Returns every problem found rather than stopping at the first.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    let errors = collect_errors(workflow);
    if errors.is_empty() {
        info!(
            "Workflow '{}' validated: {} steps",
            workflow.id,
            workflow.steps.len()
        );
        Ok(())
    } else {
        Err(EngineError::Configuration(errors))
    }
}

fn collect_errors(workflow: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }

    if workflow.steps.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !step.id.trim().is_empty() && !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    let owners: HashMap<&str, &str> = workflow
        .steps
        .iter()
        .flat_map(|step| {
            step.parallel_step_ids()
                .into_iter()
                .map(move |id| (id, step.id.as_str()))
        })
        .collect();

    for step in &workflow.steps {
        errors.extend(validate_step(step));

        for (field, reference) in step.referenced_step_ids() {
            if !seen_ids.contains(reference) {
                errors.push(ValidationError::InvalidReference {
                    step: step.id.clone(),
                    field,
                    reference: reference.to_string(),
                });
            } else if field != "stepIds" {
                // Owned steps are passed over by the main cursor.
                if let Some(owner) = owners.get(reference) {
                    errors.push(ValidationError::OwnedStepTarget {
                        step: step.id.clone(),
                        field,
                        reference: reference.to_string(),
                        owner: owner.to_string(),
                    });
                }
            }
        }
    }

    errors
}

/// Quick validation that returns a list of error messages.
///
/// Useful for editor feedback where a `Result` is inconvenient.
pub fn quick_validate(workflow: &WorkflowDefinition) -> Vec<String> {
    collect_errors(workflow)
        .iter()
        .map(|e| e.to_string())
        .collect()
}
