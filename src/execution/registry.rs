//! Execution Registry & Lifecycle Controller
//!
//! The only state shared between concurrent executions. Each in-flight
//! execution owns a `watch` channel the registry uses to signal pause,
//! resume and cancel; the scheduler observes the latest signal at every
//! between-step checkpoint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use super::record::ExecutionStatus;
use crate::error::{EngineError, Result};

/// Control signal delivered to a running execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel(Option<String>),
}

struct Entry {
    workflow_id: String,
    tenant_id: String,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    control: watch::Sender<ControlSignal>,
}

/// Snapshot of an in-flight execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ExecutionRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new execution in `pending`, enforcing the workflow's
    /// concurrency bound. Returns the receiving end of its control channel.
    pub async fn register(
        &self,
        execution_id: &str,
        workflow_id: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<watch::Receiver<ControlSignal>> {
        let mut entries = self.entries.write().await;

        if entries.contains_key(execution_id) {
            return Err(EngineError::DuplicateExecution(execution_id.to_string()));
        }

        let active = entries
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .count();
        if active >= limit {
            return Err(EngineError::ConcurrencyLimit {
                workflow_id: workflow_id.to_string(),
                active,
                limit,
            });
        }

        let (control, receiver) = watch::channel(ControlSignal::Run);
        entries.insert(
            execution_id.to_string(),
            Entry {
                workflow_id: workflow_id.to_string(),
                tenant_id: tenant_id.to_string(),
                status: ExecutionStatus::Pending,
                started_at: Utc::now(),
                control,
            },
        );
        debug!("Registered execution '{}' ({} active)", execution_id, active + 1);
        Ok(receiver)
    }

    pub async fn set_status(&self, execution_id: &str, status: ExecutionStatus) {
        if let Some(entry) = self.entries.write().await.get_mut(execution_id) {
            entry.status = status;
        }
    }

    /// Requests a pause. Valid only while running.
    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = Self::entry_mut(&mut entries, execution_id)?;
        if entry.status != ExecutionStatus::Running {
            return Err(Self::invalid(execution_id, "pause", entry.status));
        }

        entry.status = ExecutionStatus::Paused;
        entry.control.send_replace(ControlSignal::Pause);
        info!("Execution '{}' pause requested", execution_id);
        Ok(())
    }

    /// Resumes a paused execution from its current cursor.
    pub async fn resume(&self, execution_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = Self::entry_mut(&mut entries, execution_id)?;
        if entry.status != ExecutionStatus::Paused {
            return Err(Self::invalid(execution_id, "resume", entry.status));
        }

        entry.status = ExecutionStatus::Running;
        entry.control.send_replace(ControlSignal::Run);
        info!("Execution '{}' resumed", execution_id);
        Ok(())
    }

    /// Cancels a pending, running or paused execution and forgets it.
    pub async fn cancel(&self, execution_id: &str, reason: Option<String>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = Self::entry_mut(&mut entries, execution_id)?;
        if entry.status.is_terminal() {
            return Err(Self::invalid(execution_id, "cancel", entry.status));
        }

        entry.control.send_replace(ControlSignal::Cancel(reason));
        entries.remove(execution_id);
        info!("Execution '{}' cancelled", execution_id);
        Ok(())
    }

    /// Drops a finished execution.
    pub async fn unregister(&self, execution_id: &str) {
        self.entries.write().await.remove(execution_id);
    }

    pub async fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.entries.read().await.get(execution_id).map(|e| e.status)
    }

    pub async fn active(&self) -> Vec<ActiveExecution> {
        let entries = self.entries.read().await;
        let mut active: Vec<_> = entries
            .iter()
            .map(|(id, e)| ActiveExecution {
                execution_id: id.clone(),
                workflow_id: e.workflow_id.clone(),
                tenant_id: e.tenant_id.clone(),
                status: e.status,
                started_at: e.started_at,
            })
            .collect();
        active.sort_by_key(|a| a.started_at);
        active
    }

    pub async fn active_count(&self, workflow_id: &str) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .count()
    }

    fn entry_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        execution_id: &str,
    ) -> Result<&'a mut Entry> {
        entries
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    fn invalid(execution_id: &str, action: &'static str, status: ExecutionStatus) -> EngineError {
        EngineError::InvalidTransition {
            execution_id: execution_id.to_string(),
            action,
            status,
        }
    }
}
