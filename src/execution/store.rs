//! Execution Persistence
//!
//! Storage for execution records and their step trails, keyed by
//! `(tenant_id, execution_id)`.
//!
//! [`FileStore`] keeps one pretty-printed JSON document per execution at
//! `<dir>/<tenant>/<execution>.json`, rewritten after every update so an
//! interrupted run leaves its last known progress on disk.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use super::record::{ExecutionRecord, StepExecutionRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode execution document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("execution '{execution_id}' already exists for tenant '{tenant_id}'")]
    AlreadyExists {
        tenant_id: String,
        execution_id: String,
    },

    #[error("execution '{execution_id}' not found for tenant '{tenant_id}'")]
    NotFound {
        tenant_id: String,
        execution_id: String,
    },

    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}

/// Persistence contract for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Stores a new execution record.
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Replaces the stored execution record.
    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Appends a step attempt to the execution's trail.
    async fn append_step(&self, record: &StepExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Step attempts in the order they were appended.
    async fn step_records(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>, StoreError>;
}

/// Everything stored for one execution.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDocument {
    pub execution: ExecutionRecord,

    #[serde(default)]
    pub steps: Vec<StepExecutionRecord>,
}

type Key = (String, String);

fn key_of(tenant_id: &str, execution_id: &str) -> Key {
    (tenant_id.to_string(), execution_id.to_string())
}

fn not_found(tenant_id: &str, execution_id: &str) -> StoreError {
    StoreError::NotFound {
        tenant_id: tenant_id.to_string(),
        execution_id: execution_id.to_string(),
    }
}

/// In-process store; the engine default.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Key, ExecutionDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let key = key_of(&record.tenant_id, &record.execution_id);
        if documents.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                tenant_id: record.tenant_id.clone(),
                execution_id: record.execution_id.clone(),
            });
        }
        documents.insert(
            key,
            ExecutionDocument {
                execution: record.clone(),
                steps: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&key_of(&record.tenant_id, &record.execution_id))
            .ok_or_else(|| not_found(&record.tenant_id, &record.execution_id))?;
        document.execution = record.clone();
        Ok(())
    }

    async fn append_step(&self, record: &StepExecutionRecord) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&key_of(&record.tenant_id, &record.execution_id))
            .ok_or_else(|| not_found(&record.tenant_id, &record.execution_id))?;
        document.steps.push(record.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&key_of(tenant_id, execution_id))
            .map(|d| d.execution.clone()))
    }

    async fn step_records(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&key_of(tenant_id, execution_id))
            .map(|d| d.steps.clone())
            .unwrap_or_default())
    }
}

/// JSON-file store rooted at a directory.
pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on documents.
    lock: RwLock<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn checked(segment: &str) -> Result<&str, StoreError> {
        let bad = segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains(['/', '\\']);
        if bad {
            Err(StoreError::InvalidKey(segment.to_string()))
        } else {
            Ok(segment)
        }
    }

    /// Path of the document for an execution.
    pub fn document_path(&self, tenant_id: &str, execution_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(Self::checked(tenant_id)?)
            .join(format!("{}.json", Self::checked(execution_id)?)))
    }

    async fn read_document(&self, path: &Path) -> Result<Option<ExecutionDocument>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, path: &Path, document: &ExecutionDocument) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(document)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        debug!("Saved execution document to {}", path.display());
        Ok(())
    }

    async fn modify<F>(&self, tenant_id: &str, execution_id: &str, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ExecutionDocument) + Send,
    {
        let _guard = self.lock.write().await;
        let path = self.document_path(tenant_id, execution_id)?;
        let mut document = self
            .read_document(&path)
            .await?
            .ok_or_else(|| not_found(tenant_id, execution_id))?;
        change(&mut document);
        self.write_document(&path, &document).await
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let _guard = self.lock.write().await;
        let path = self.document_path(&record.tenant_id, &record.execution_id)?;
        if fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists {
                tenant_id: record.tenant_id.clone(),
                execution_id: record.execution_id.clone(),
            });
        }

        let document = ExecutionDocument {
            execution: record.clone(),
            steps: Vec::new(),
        };
        self.write_document(&path, &document).await?;
        info!("Created execution document {}", path.display());
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let updated = record.clone();
        self.modify(&record.tenant_id, &record.execution_id, move |doc| {
            doc.execution = updated
        })
        .await
    }

    async fn append_step(&self, record: &StepExecutionRecord) -> Result<(), StoreError> {
        let step = record.clone();
        self.modify(&record.tenant_id, &record.execution_id, move |doc| {
            doc.steps.push(step)
        })
        .await
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let _guard = self.lock.read().await;
        let path = self.document_path(tenant_id, execution_id)?;
        Ok(self.read_document(&path).await?.map(|d| d.execution))
    }

    async fn step_records(
        &self,
        tenant_id: &str,
        execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        let _guard = self.lock.read().await;
        let path = self.document_path(tenant_id, execution_id)?;
        Ok(self
            .read_document(&path)
            .await?
            .map(|d| d.steps)
            .unwrap_or_default())
    }
}
