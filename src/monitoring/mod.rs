//! Monitoring Module
//!
//! Observability for executions: lifecycle events and resource usage
//! sampling.
//!
//! # Components
//!
//! - [`EventSink`]: receiver of `workflow.execution.*` events
//! - [`ResourceMonitor`]: CPU and memory usage tracking

pub mod events;
pub mod resource;

pub use events::{ChannelSink, CollectingSink, EventSink, ExecutionEvent, ExecutionEventKind, LogSink};
pub use resource::{ResourceMonitor, ResourceSample, ResourceUsage};
