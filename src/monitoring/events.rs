//! Execution Events
//!
//! Lifecycle notifications published when an execution finishes, pauses,
//! resumes or is cancelled.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};

use crate::execution::record::{ExecutionRecord, ExecutionStatus};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEventKind {
    #[serde(rename = "workflow.execution.completed")]
    Completed,
    #[serde(rename = "workflow.execution.failed")]
    Failed,
    #[serde(rename = "workflow.execution.paused")]
    Paused,
    #[serde(rename = "workflow.execution.resumed")]
    Resumed,
    #[serde(rename = "workflow.execution.cancelled")]
    Cancelled,
}

impl ExecutionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "workflow.execution.completed",
            Self::Failed => "workflow.execution.failed",
            Self::Paused => "workflow.execution.paused",
            Self::Resumed => "workflow.execution.resumed",
            Self::Cancelled => "workflow.execution.cancelled",
        }
    }

    /// Event announcing a terminal status. Timeouts are reported as failures.
    pub fn for_terminal(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Completed => Some(Self::Completed),
            ExecutionStatus::Failed | ExecutionStatus::Timeout => Some(Self::Failed),
            ExecutionStatus::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub kind: ExecutionEventKind,
    pub tenant_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default)]
    pub metrics: Map<String, Value>,

    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(kind: ExecutionEventKind, record: &ExecutionRecord) -> Self {
        Self {
            kind,
            tenant_id: record.tenant_id.clone(),
            workflow_id: record.workflow_id.clone(),
            execution_id: record.execution_id.clone(),
            status: record.status,
            duration_ms: record.duration_ms,
            metrics: record.metrics.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of execution events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ExecutionEvent);
}

/// Writes events to the log. The engine default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: ExecutionEvent) {
        info!(
            "{} execution={} workflow={} tenant={} status={}{}",
            event.kind,
            event.execution_id,
            event.workflow_id,
            event.tenant_id,
            event.status,
            event
                .duration_ms
                .map(|ms| format!(" duration={}ms", ms))
                .unwrap_or_default()
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().await.clone()
    }

    pub async fn kinds(&self) -> Vec<ExecutionEventKind> {
        self.events.lock().await.iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: ExecutionEvent) {
        self.events.lock().await.push(event);
    }
}

/// Forwards events into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    /// Creates the sink together with the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ExecutionEvent) {
        if let Err(e) = self.sender.send(event) {
            warn!("Dropping {} event: receiver closed", e.0.kind);
        }
    }
}
