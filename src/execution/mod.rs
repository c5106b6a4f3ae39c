//! Workflow Execution Module
//!
//! Provides the execution engine that drives a workflow's steps, and the
//! pieces it is assembled from.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine and caller API
//! - [`scheduler`]: Cursor over the ordered steps
//! - [`dispatch`]: Handler contract and dispatch table
//! - [`handlers`]: Built-in step handlers
//! - [`condition`]: Condition evaluation
//! - [`mapper`]: Input/output mappings
//! - [`policy`] and [`retry`]: Failure handling
//! - [`registry`]: In-flight executions and their lifecycle
//! - [`record`] and [`store`]: Execution records and persistence

pub mod condition;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod mapper;
pub mod policy;
pub mod record;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod template;

pub use context::{ExecutionContext, ExecutionOptions, SystemContext, UserContext};
pub use dispatch::{ActionError, ActionHandler, ActionRegistry, DispatchOutcome, StepResult};
pub use engine::Engine;
pub use record::{ExecutionRecord, ExecutionStatus, StepExecutionRecord, StepStatus};
pub use registry::{ActiveExecution, ControlSignal, ExecutionRegistry};
pub use store::{ExecutionStore, FileStore, MemoryStore, StoreError};
pub use template::interpolate;
