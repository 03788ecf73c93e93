use std::future::Future;

use super::{fresh, seeded_parameters, TestResult, SEEDED_TASK};
use crate::record::TaskParameters;
use crate::{StorageError, TaskStore};

pub(super) async fn run_lookup_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "lookup",
            "seeded_task_parameters_round_trip",
            seeded_task_parameters_round_trip(factory).await,
        ),
        TestResult::from_result(
            "lookup",
            "unknown_task_is_not_found",
            unknown_task_is_not_found(factory).await,
        ),
    ]
}

async fn seeded_task_parameters_round_trip<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    let store = fresh(factory).await;
    let params = store
        .get_task_parameters(SEEDED_TASK)
        .await
        .map_err(|e| format!("lookup failed: {}", e))?;
    if params != seeded_parameters() {
        return Err(format!("unexpected parameters: {:?}", params));
    }
    Ok(())
}

async fn unknown_task_is_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    let store = fresh(factory).await;
    match store.get_task_parameters("no-such-task").await {
        Err(StorageError::TaskNotFound { task_id }) if task_id == "no-such-task" => Ok(()),
        Err(other) => Err(format!("expected TaskNotFound, got {}", other)),
        Ok(params) => Err(format!("expected TaskNotFound, got {:?}", params)),
    }
}
