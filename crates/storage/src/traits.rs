use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::record::{TaskParameters, TaskStatus};

/// The LIMS task/inventory store, as seen by a station.
///
/// Everything else the web application does (auth, admin, inventory CRUD)
/// stays on its side of this trait.
///
/// Implementations must be `Send + Sync + 'static` so they can be shared
/// between the relay loop and background runs.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Record the terminal outcome of a task together with its artifacts
    /// (archive ids, measured masses, ...). Submitting again for the same
    /// task replaces the earlier result.
    async fn submit_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        artifacts: Value,
    ) -> Result<(), StorageError>;

    /// The parameters a task was created with. Nothing in the station
    /// process reads them yet; commands arrive with their parameters inline.
    ///
    /// Returns `Err(StorageError::TaskNotFound)` for unknown tasks.
    async fn get_task_parameters(&self, task_id: &str) -> Result<TaskParameters, StorageError>;
}
