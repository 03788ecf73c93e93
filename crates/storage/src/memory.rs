//! In-process [`TaskStore`], used by tests and by workers running without a
//! LIMS backend.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::record::{TaskParameters, TaskResult, TaskStatus};
use crate::traits::TaskStore;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    parameters: RwLock<HashMap<String, TaskParameters>>,
    results: RwLock<HashMap<String, TaskResult>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed parameters for a task.
    pub async fn insert_task(&self, task_id: &str, params: TaskParameters) {
        self.parameters
            .write()
            .await
            .insert(task_id.to_string(), params);
    }

    pub async fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.results.read().await.get(task_id).cloned()
    }

    pub async fn result_count(&self) -> usize {
        self.results.read().await.len()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn submit_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        artifacts: Value,
    ) -> Result<(), StorageError> {
        let result = TaskResult {
            task_id: task_id.to_string(),
            status,
            artifacts,
        };
        self.results
            .write()
            .await
            .insert(task_id.to_string(), result);
        Ok(())
    }

    async fn get_task_parameters(&self, task_id: &str) -> Result<TaskParameters, StorageError> {
        self.parameters
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StorageError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }
}
