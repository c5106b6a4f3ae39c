//! FlowRunner - Workflow Execution Engine
//!
//! Drives declarative, step-based business workflows (stock checks,
//! reorders, notifications) to completion against pluggable action
//! handlers, with branching, per-step error policies, retries, timeouts and
//! pause/resume/cancel of in-flight executions.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Workflow definitions, parsing and validation
//! - [`execution`]: The engine, its scheduler and handlers
//! - [`monitoring`]: Lifecycle events and resource usage sampling
//! - [`config`]: Engine-wide defaults
//! - [`error`]: Error taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::{load_workflow, ActionRegistry, Engine, EngineConfig, ExecutionOptions};
//! use serde_json::Map;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("reorder.yaml")?;
//!     let workflow_id = workflow.id.clone();
//!
//!     // Create the engine with the built-in handlers
//!     let engine = Engine::new(EngineConfig::default(), ActionRegistry::with_builtins());
//!     engine.register_workflow(workflow).await?;
//!
//!     // Execute the workflow
//!     let record = engine
//!         .execute_workflow(&workflow_id, "exec-1", Map::new(), ExecutionOptions::dry_run())
//!         .await?;
//!     println!("{}", record.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::{ConditionSemantics, EngineConfig};
pub use error::{EngineError, Result};
pub use execution::{
    ActionError, ActionHandler, ActionRegistry, Engine, ExecutionContext, ExecutionOptions,
    ExecutionRecord, ExecutionStatus, StepResult,
};
pub use workflow::model::{StepDefinition, StepType, WorkflowDefinition};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
