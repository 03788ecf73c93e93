mod common;

use std::sync::Arc;

use lims_devices::registry::acquire;
use lims_protocol::{Stage, WorkerCommand, WorkerEvent};
use lims_storage::{InMemoryTaskStore, TaskStatus};
use lims_worker::station::arm_status;
use lims_worker::{Dispatcher, StationHandle};
use tokio::sync::mpsc;

use common::{next_event, wait_for, FakeGcms};

#[tokio::test]
async fn analysis_reports_every_stage_then_one_terminal_event() {
    let tmp = tempfile::tempdir().unwrap();
    let (arm, handle) = common::gcms(tmp.path(), FakeGcms::default());
    let store = Arc::new(InMemoryTaskStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(Arc::new(handle), tx).with_task_store(store.clone());

    dispatcher.handle_frame(r#"{"kind": "start_analysis", "bottle": 4, "sequence": 1, "task_id": "t-1"}"#);

    assert!(matches!(
        next_event(&mut rx).await,
        WorkerEvent::AnalysisStarted { bottle_num: 4, sequence_index: Some(1), .. }
    ));
    let mut stages = Vec::new();
    let archive_id = loop {
        match next_event(&mut rx).await {
            WorkerEvent::AnalysisProgress { stage, bottle_num, .. } => {
                assert_eq!(bottle_num, 4);
                stages.push(stage);
            }
            WorkerEvent::AnalysisComplete { archive_id, .. } => break archive_id,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(stages, Stage::ORDER.to_vec());
    assert_eq!(arm.launch_log(), vec!["kb_to_gcms", "gc_drop"]);
    common::until_idle(&dispatcher).await;

    let submitted = store.result("t-1").await.unwrap();
    assert_eq!(submitted.status, TaskStatus::Completed);
    assert_eq!(submitted.artifacts["archive_id"], archive_id.as_str());

    // The archived copy answers later result queries.
    dispatcher.handle_frame(&format!(r#"{{"message": "get_result_4_1_{archive_id}"}}"#));
    match next_event(&mut rx).await {
        WorkerEvent::AnalysisResult { available, series, .. } => {
            assert!(available);
            assert_eq!(series.unwrap().y, vec![10.0, 12.0]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn result_without_archive_id_is_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let (_arm, handle) = common::gcms(tmp.path(), FakeGcms::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(Arc::new(handle), tx);

    dispatcher.handle(WorkerCommand::GetResult {
        bottle: Some(4),
        sequence: Some(1),
        archive_id: None,
    });
    match next_event(&mut rx).await {
        WorkerEvent::AnalysisResult { available, message, .. } => {
            assert!(!available);
            assert!(message.unwrap().contains("缺少归档ID"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn queries_are_answered_during_a_run_and_force_stop_cancels_it() {
    let tmp = tempfile::tempdir().unwrap();
    let instrument = FakeGcms::default();
    instrument.hold();
    let (arm, handle) = common::gcms(tmp.path(), instrument.clone());
    let store = Arc::new(InMemoryTaskStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(Arc::new(handle), tx).with_task_store(store.clone());

    dispatcher.handle(WorkerCommand::StartAnalysis {
        bottle: 2,
        sequence: Some(1),
        task_id: Some("t-2".into()),
    });
    wait_for(&mut rx, |e| {
        matches!(e, WorkerEvent::AnalysisProgress { stage: Stage::AwaitCompletion, .. })
    })
    .await;

    dispatcher.handle(WorkerCommand::GetStatus);
    match next_event(&mut rx).await {
        WorkerEvent::StatusUpdate { run_mode, error, .. } => {
            assert_eq!(run_mode, "Run");
            assert!(error.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }

    dispatcher.handle(WorkerCommand::StartAnalysis {
        bottle: 3,
        sequence: None,
        task_id: None,
    });
    match next_event(&mut rx).await {
        WorkerEvent::Error { message, .. } => assert!(message.contains("瓶号 2")),
        other => panic!("unexpected {other:?}"),
    }

    dispatcher.handle(WorkerCommand::ForceStop);
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Info { .. }));
    match next_event(&mut rx).await {
        WorkerEvent::AnalysisError { bottle_num, stage, .. } => {
            assert_eq!(bottle_num, 2);
            assert_eq!(stage, Some(Stage::AwaitCompletion));
        }
        other => panic!("unexpected {other:?}"),
    }
    // The vial was loaded but never unloaded; the stop does not move the arm.
    assert_eq!(arm.launch_log(), vec!["kb_to_gcms"]);
    assert_eq!(store.result("t-2").await.unwrap().status, TaskStatus::Cancelled);
    common::until_idle(&dispatcher).await;
}

#[tokio::test]
async fn sequence_list_and_arm_status() {
    let tmp = tempfile::tempdir().unwrap();
    let (_arm, handle) = common::gcms(tmp.path(), FakeGcms::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(Arc::new(handle), tx);

    dispatcher.handle_frame(r#"{"message": "get_sequence_list", "sender": "web_1"}"#);
    match next_event(&mut rx).await {
        WorkerEvent::SequenceList { sequences, .. } => {
            assert_eq!(sequences.len(), 1);
            assert_eq!(sequences[0].index, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    dispatcher.handle(WorkerCommand::GetArmStatus);
    match next_event(&mut rx).await {
        WorkerEvent::ArmStatus { connected, b_value, .. } => {
            assert!(connected);
            assert_eq!(b_value, Some(0));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn arm_status_does_not_wait_for_a_running_step() {
    let tmp = tempfile::tempdir().unwrap();
    let (_arm, handle) = common::gcms(tmp.path(), FakeGcms::default());
    let arm = handle.arm().unwrap().clone();

    let running = acquire(&arm);
    match arm_status(&arm) {
        WorkerEvent::ArmStatus {
            connected,
            busy,
            b_value,
            error,
            ..
        } => {
            assert!(connected);
            assert!(busy);
            assert_eq!(b_value, None);
            assert!(error.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
    drop(running);

    match arm_status(&arm) {
        WorkerEvent::ArmStatus { busy, b_value, .. } => {
            assert!(!busy);
            assert_eq!(b_value, Some(0));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn dispensing_batch_reports_measured_masses() {
    let (arm, port, handle) = common::dispensing();
    port.set_final_weight_ug(5_000);
    let store = Arc::new(InMemoryTaskStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(Arc::new(handle), tx).with_task_store(store.clone());

    dispatcher.handle_frame(
        r#"{"command": "gtcl_all", "payload": {"solids_list": [4.0], "liquids_list": [1.0],
            "bottle_15ml_pos": 1, "start_tip_pos": [1, 1], "task_id": "t-3"}}"#,
    );
    match next_event(&mut rx).await {
        WorkerEvent::BatchComplete { result, .. } => {
            assert_eq!(result["solids_list"][0], 5.0);
            assert_eq!(result["start_tip_pos"], serde_json::json!([0, 1]));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(arm.launch_log().last().map(String::as_str), Some("shiguan_back"));
    let submitted = store.result("t-3").await.unwrap();
    assert_eq!(submitted.status, TaskStatus::Completed);

    // Analysis commands belong to the instrument stations.
    dispatcher.handle(WorkerCommand::MoveTower);
    assert!(matches!(next_event(&mut rx).await, WorkerEvent::Error { .. }));
}

#[tokio::test]
async fn dispensing_batch_without_tips_fails() {
    let (arm, _port, handle) = common::dispensing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(Arc::new(handle), tx);

    dispatcher.handle_frame(
        r#"{"command": "gtcl_all", "payload": {"solids_list": [], "liquids_list": [1.0],
            "bottle_15ml_pos": 1, "start_tip_pos": [0]}}"#,
    );
    match next_event(&mut rx).await {
        WorkerEvent::BatchError { error, request, .. } => {
            assert_eq!(error, "加液失败：没有可用的枪头。");
            assert_eq!(request["liquids_list"], serde_json::json!([1.0]));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(arm.launch_log().is_empty());
}
