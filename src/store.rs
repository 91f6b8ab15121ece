//! Persistence contract.
//!
//! CRUD for the entities the engine needs to reconstruct scheduling state
//! after a crash: definitions, executions, task executions, approvals, and
//! queue entries. Ships an in-memory implementation for tests and a
//! file-backed implementation for single-node deployments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::definition::WorkflowDefinition;
use crate::queue::QueueEntry;
use crate::scheduler::{Approval, TaskExecution, WorkflowExecution};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;
    async fn load_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;
    async fn load_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError>;
    /// Executions that have not reached a terminal state, for recovery.
    async fn load_active_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError>;

    async fn save_task(
        &self,
        execution_id: &str,
        task: &TaskExecution,
    ) -> Result<(), StoreError>;
    async fn load_tasks(&self, execution_id: &str) -> Result<Vec<TaskExecution>, StoreError>;

    async fn save_approval(
        &self,
        execution_id: &str,
        approval: &Approval,
    ) -> Result<(), StoreError>;
    async fn load_approvals(&self, execution_id: &str) -> Result<Vec<Approval>, StoreError>;

    async fn save_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError>;
    async fn load_queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    definitions: HashMap<String, WorkflowDefinition>,
    executions: HashMap<String, WorkflowExecution>,
    tasks: HashMap<String, HashMap<String, TaskExecution>>,
    approvals: HashMap<String, HashMap<String, Approval>>,
    queue_entries: HashMap<String, QueueEntry>,
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryExecutionStore {
    state: tokio::sync::RwLock<MemoryState>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn load_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.state.read().await.definitions.get(id).cloned())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .executions
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.state.read().await.executions.get(execution_id).cloned())
    }

    async fn load_active_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn save_task(
        &self,
        execution_id: &str,
        task: &TaskExecution,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .tasks
            .entry(execution_id.to_string())
            .or_default()
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn load_tasks(&self, execution_id: &str) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .tasks
            .get(execution_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_approval(
        &self,
        execution_id: &str,
        approval: &Approval,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .approvals
            .entry(execution_id.to_string())
            .or_default()
            .insert(approval.task_id.clone(), approval.clone());
        Ok(())
    }

    async fn load_approvals(&self, execution_id: &str) -> Result<Vec<Approval>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .approvals
            .get(execution_id)
            .map(|approvals| approvals.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .queue_entries
            .insert(entry.entry_id.clone(), entry.clone());
        Ok(())
    }

    async fn load_queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self.state.read().await.queue_entries.values().cloned().collect())
    }
}

/// File-backed store: one JSON document per entity under a base directory.
pub struct FileExecutionStore {
    dir: PathBuf,
}

impl FileExecutionStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        for sub in ["definitions", "executions", "tasks", "approvals", "queue"] {
            std::fs::create_dir_all(dir.join(sub))
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        Ok(Self { dir })
    }

    fn path(&self, kind: &str, id: &str) -> PathBuf {
        self.dir.join(kind).join(format!("{}.json", id))
    }

    async fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        path: PathBuf,
    ) -> Result<Option<T>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Storage(e.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn read_dir_json<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.dir.join(kind))
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                if let Some(value) = self.read_json::<T>(entry.path()).await? {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ExecutionStore for FileExecutionStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.write_json(self.path("definitions", &definition.id), definition)
            .await
    }

    async fn load_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.read_json(self.path("definitions", id)).await
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.write_json(self.path("executions", &execution.execution_id), execution)
            .await
    }

    async fn load_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        self.read_json(self.path("executions", execution_id)).await
    }

    async fn load_active_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let all: Vec<WorkflowExecution> = self.read_dir_json("executions").await?;
        Ok(all.into_iter().filter(|e| !e.status.is_terminal()).collect())
    }

    async fn save_task(
        &self,
        execution_id: &str,
        task: &TaskExecution,
    ) -> Result<(), StoreError> {
        let path = self.path("tasks", execution_id);
        let mut tasks: HashMap<String, TaskExecution> =
            self.read_json(path.clone()).await?.unwrap_or_default();
        tasks.insert(task.task_id.clone(), task.clone());
        self.write_json(path, &tasks).await
    }

    async fn load_tasks(&self, execution_id: &str) -> Result<Vec<TaskExecution>, StoreError> {
        let tasks: Option<HashMap<String, TaskExecution>> =
            self.read_json(self.path("tasks", execution_id)).await?;
        Ok(tasks.map(|t| t.into_values().collect()).unwrap_or_default())
    }

    async fn save_approval(
        &self,
        execution_id: &str,
        approval: &Approval,
    ) -> Result<(), StoreError> {
        let path = self.path("approvals", execution_id);
        let mut approvals: HashMap<String, Approval> =
            self.read_json(path.clone()).await?.unwrap_or_default();
        approvals.insert(approval.task_id.clone(), approval.clone());
        self.write_json(path, &approvals).await
    }

    async fn load_approvals(&self, execution_id: &str) -> Result<Vec<Approval>, StoreError> {
        let approvals: Option<HashMap<String, Approval>> =
            self.read_json(self.path("approvals", execution_id)).await?;
        Ok(approvals
            .map(|a| a.into_values().collect())
            .unwrap_or_default())
    }

    async fn save_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.write_json(self.path("queue", &entry.entry_id), entry)
            .await
    }

    async fn load_queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.read_dir_json("queue").await
    }
}
