//! Conformance checks for [`TaskStore`] implementations.
//!
//! A station only relies on two behaviours of the LIMS store: parameters of
//! a known task can be read back, and results can be submitted (and
//! resubmitted) for any task the station was given. Backends run
//! [`run_conformance_suite`] with a factory that returns a fresh store
//! already holding one seeded task:
//!
//! ```ignore
//! let report = run_conformance_suite(|id, params| async move {
//!     let store = InMemoryTaskStore::new();
//!     store.insert_task(id, params).await;
//!     store
//! })
//! .await;
//! assert!(report.failed == 0, "{report}");
//! ```

mod lookup;
mod submit;

use std::fmt;
use std::future::Future;

use serde_json::json;

use crate::record::TaskParameters;
use crate::TaskStore;

/// Id of the task every factory call must seed.
pub const SEEDED_TASK: &str = "conformance-task";

#[derive(Debug, Clone)]
pub struct TestResult {
    pub category: String,
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "TaskStore conformance: {}/{} passed",
            self.passed,
            self.results.len()
        )?;
        for r in self.results.iter().filter(|r| !r.passed) {
            writeln!(
                f,
                "  FAIL [{}/{}]: {}",
                r.category,
                r.name,
                r.message.as_deref().unwrap_or("(no message)")
            )?;
        }
        Ok(())
    }
}

/// Parameters the factory is asked to seed under [`SEEDED_TASK`].
pub fn seeded_parameters() -> TaskParameters {
    TaskParameters {
        materials: vec![json!({"name": "NaCl", "mass_mg": 12.5})],
        stations: vec!["gypl".to_string(), "gcms".to_string()],
        targets: json!({"solids": [12.5]}),
    }
}

pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();
    results.extend(lookup::run_lookup_tests(&factory).await);
    results.extend(submit::run_submit_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;
    ConformanceReport {
        results,
        passed,
        failed,
    }
}

async fn fresh<S, F, Fut>(factory: &F) -> S
where
    S: TaskStore,
    F: Fn(&'static str, TaskParameters) -> Fut,
    Fut: Future<Output = S>,
{
    factory(SEEDED_TASK, seeded_parameters()).await
}
