//! Workflow Parser
//!
//! Loads workflow definitions from YAML or JSON files. JSON is accepted
//! through the YAML parser, so a single entry point handles both formats.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate_workflow;
use crate::error::{EngineError, Result};

/// Parses a workflow definition from a YAML or JSON string without
/// validating it.
pub fn parse_workflow(content: &str) -> Result<WorkflowDefinition> {
    serde_yaml::from_str(content).map_err(|e| {
        EngineError::Parse(format!(
            "Failed to parse workflow definition: {}. Check the file format.",
            e
        ))
    })
}

/// Loads a workflow from a YAML or JSON file.
///
/// This function:
/// 1. Reads and parses the file
/// 2. Validates the definition (references, policies, conditions)
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("reorder.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let workflow = parse_workflow(&content)?;

    info!(
        "Parsed workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );

    validate_workflow(&workflow)?;

    Ok(workflow)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml_content =
        serde_yaml::to_string(workflow).map_err(|e| EngineError::Parse(e.to_string()))?;
    fs::write(path, yaml_content)?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
