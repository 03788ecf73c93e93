//! [`TaskStore`] backed by the LIMS web API.
//!
//! Requests are blocking `ureq` calls, each moved onto the blocking pool.
//!
//! - parameters: `GET {base_url}/api/task/{id}/` → `{"ok": true, "task": {...}}`
//! - results: `POST {base_url}/api/task/{id}/update/` with
//!   `{"status", "reason", "artifacts"}`

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StorageError;
use crate::record::{TaskParameters, TaskStatus};
use crate::traits::TaskStore;

#[derive(Debug, Clone)]
pub struct HttpTaskStore {
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTaskStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn task_url(&self, task_id: &str, suffix: &str) -> String {
        format!("{}/api/task/{}/{}", self.base_url, task_id, suffix)
    }
}

fn classify(task_id: &str, err: ureq::Error) -> StorageError {
    match err {
        ureq::Error::StatusCode(404) => StorageError::TaskNotFound {
            task_id: task_id.to_string(),
        },
        other => StorageError::Backend(other.to_string()),
    }
}

/// Pull the fields a station cares about out of the task detail document.
fn parameters_from_detail(detail: &Value) -> Result<TaskParameters, StorageError> {
    if detail["ok"] == Value::Bool(false) {
        return Err(StorageError::Backend(
            detail["message"].as_str().unwrap_or("request rejected").to_string(),
        ));
    }
    let task = detail
        .get("task")
        .ok_or_else(|| StorageError::Parse("task detail has no 'task' object".into()))?;
    let stations = match &task["stations"] {
        Value::Array(items) => items
            .iter()
            .filter_map(|s| s.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let materials = match &task["station_materials"] {
        Value::Object(map) => map.values().cloned().collect(),
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    };
    Ok(TaskParameters {
        materials,
        stations,
        targets: task.get("targets").cloned().unwrap_or(Value::Null),
    })
}

#[async_trait]
impl TaskStore for HttpTaskStore {
    async fn submit_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        artifacts: Value,
    ) -> Result<(), StorageError> {
        let url = self.task_url(task_id, "update/");
        let token = self.auth_token.clone();
        let id = task_id.to_string();
        let body = json!({
            "status": status.lims_value(),
            "reason": format!("station reported {:?}", status).to_lowercase(),
            "artifacts": artifacts,
        });

        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut request = agent.post(&url);
            if let Some(ref token) = token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }
            request.send_json(body).map_err(|e| classify(&id, e))?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))?
    }

    async fn get_task_parameters(&self, task_id: &str) -> Result<TaskParameters, StorageError> {
        let url = self.task_url(task_id, "");
        let token = self.auth_token.clone();
        let id = task_id.to_string();

        let detail: Value = tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut request = agent.get(&url);
            if let Some(ref token) = token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }
            let response = request.call().map_err(|e| classify(&id, e))?;
            response
                .into_body()
                .read_json()
                .map_err(|e| StorageError::Parse(format!("task detail is not JSON: {}", e)))
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))??;

        parameters_from_detail(&detail)
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
