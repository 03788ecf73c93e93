use std::future::Future;
use std::sync::Arc;

use serde_json::json;

use super::{fresh, TestResult, SEEDED_TASK};
use crate::record::{TaskParameters, TaskStatus};
use crate::TaskStore;

pub(super) async fn run_submit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "submit",
            "terminal_statuses_accepted",
            terminal_statuses_accepted(factory).await,
        ),
        TestResult::from_result(
            "submit",
            "resubmission_is_accepted",
            resubmission_is_accepted(factory).await,
        ),
        TestResult::from_result(
            "submit",
            "submission_keeps_parameters",
            submission_keeps_parameters(factory).await,
        ),
        TestResult::from_result(
            "submit",
            "concurrent_submissions_succeed",
            concurrent_submissions_succeed(factory).await,
        ),
    ]
}

async fn terminal_statuses_accepted<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    for status in [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        let store = fresh(factory).await;
        store
            .submit_task_result(SEEDED_TASK, status, json!({"archive_id": "x"}))
            .await
            .map_err(|e| format!("{:?} rejected: {}", status, e))?;
    }
    Ok(())
}

async fn resubmission_is_accepted<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    let store = fresh(factory).await;
    for status in [TaskStatus::InProgress, TaskStatus::Completed] {
        store
            .submit_task_result(SEEDED_TASK, status, json!({}))
            .await
            .map_err(|e| format!("submission of {:?} failed: {}", status, e))?;
    }
    Ok(())
}

async fn submission_keeps_parameters<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    let store = fresh(factory).await;
    let before = store
        .get_task_parameters(SEEDED_TASK)
        .await
        .map_err(|e| e.to_string())?;
    store
        .submit_task_result(SEEDED_TASK, TaskStatus::Completed, json!({"mass": 1.0}))
        .await
        .map_err(|e| e.to_string())?;
    let after = store
        .get_task_parameters(SEEDED_TASK)
        .await
        .map_err(|e| e.to_string())?;
    if before != after {
        return Err("parameters changed after result submission".into());
    }
    Ok(())
}

async fn concurrent_submissions_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(fresh(factory).await);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .submit_task_result(SEEDED_TASK, TaskStatus::Completed, json!({"run": i}))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("join error: {}", e))?
            .map_err(|e| format!("concurrent submission failed: {}", e))?;
    }
    Ok(())
}
