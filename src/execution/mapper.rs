//! Data Mapper
//!
//! Builds a step's input from the execution context and writes its result
//! back, following the step's declared input and output mappings.

use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;

use super::condition::lookup;
use super::context::ExecutionContext;
use crate::workflow::model::{InputSource, OutputTarget, StepDefinition};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("required input '{field}' not found at '{path}'")]
    MissingRequired { field: String, path: String },
}

/// Reads a dotted path out of a map.
pub fn get_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    match path.split_once('.') {
        Some((head, rest)) => map.get(head).and_then(|value| lookup(value, rest)),
        None => map.get(path),
    }
}

/// Writes `value` at a dotted path, creating intermediate objects and
/// replacing any non-object found along the way.
pub fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Shallow merge: top-level keys of `source` overwrite those in `target`.
pub fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

/// Resolves the input handed to a step's handler.
///
/// Without any input mapping the step sees every variable overlaid by the
/// accumulated step data.
pub fn resolve_input(
    step: &StepDefinition,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, MappingError> {
    if step.input_mapping.is_empty() {
        let mut input = ctx.variables.clone();
        merge_into(&mut input, &ctx.execution_data);
        return Ok(input);
    }

    let mut input = Map::new();
    for (field, mapping) in &step.input_mapping {
        let path = mapping.path.as_deref().unwrap_or(field);

        let found = match mapping.source {
            InputSource::WorkflowVariable => get_path(&ctx.variables, path).cloned(),
            InputSource::PreviousStep => get_path(&ctx.execution_data, path).cloned(),
            InputSource::UserInput => get_path(&ctx.input_data, path).cloned(),
            InputSource::StaticValue => None,
        };

        match found.or_else(|| mapping.default.clone()) {
            Some(value) => set_path(&mut input, field, value),
            None if mapping.required => {
                return Err(MappingError::MissingRequired {
                    field: field.clone(),
                    path: path.to_string(),
                })
            }
            None => debug!("Step '{}': optional input '{}' unresolved", step.id, field),
        }
    }

    Ok(input)
}

/// Stores a step's result data into the context.
///
/// Without any output mapping the whole payload is merged into the
/// execution data.
pub fn apply_output(step: &StepDefinition, data: &Map<String, Value>, ctx: &mut ExecutionContext) {
    if step.output_mapping.is_empty() {
        merge_into(&mut ctx.execution_data, data);
        return;
    }

    for (field, mapping) in &step.output_mapping {
        let Some(value) = get_path(data, field) else {
            debug!("Step '{}': output field '{}' not in result", step.id, field);
            continue;
        };
        let path = mapping.path.as_deref().unwrap_or(field);

        match mapping.target {
            OutputTarget::WorkflowVariable => set_path(&mut ctx.variables, path, value.clone()),
            OutputTarget::NextStep | OutputTarget::WorkflowOutput => {
                set_path(&mut ctx.execution_data, path, value.clone())
            }
        }
    }
}
