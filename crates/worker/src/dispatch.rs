//! Turns decoded commands into events.
//!
//! Queries run on the blocking pool and answer with one event each.
//! Analysis runs and dispensing batches take the station's single job
//! slot: a second one is refused while the first is running. A run emits
//! `analysis_started`, then one progress event per stage, then exactly one
//! of `analysis_complete` / `analysis_error`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lims_devices::CancelFlag;
use lims_protocol::{
    decode_frame, local_timestamp, BatchRequest, Inbound, Stage, WorkerCommand, WorkerEvent,
};
use lims_station::StationError;
use lims_storage::{TaskStatus, TaskStore};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::station::{batch_artifacts, unsupported, StationHandle};

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// The job currently holding the slot.
struct ActiveJob {
    label: String,
    /// `None` for jobs that cannot be stopped part way.
    cancel: Option<CancelFlag>,
}

#[derive(Clone)]
pub struct Dispatcher {
    station: Arc<dyn StationHandle>,
    events: EventSender,
    store: Option<Arc<dyn TaskStore>>,
    active: Arc<Mutex<Option<ActiveJob>>>,
}

impl Dispatcher {
    pub fn new(station: Arc<dyn StationHandle>, events: EventSender) -> Self {
        Self {
            station,
            events,
            store: None,
            active: Arc::default(),
        }
    }

    /// Submit the outcome of every command carrying a `task_id` to `store`.
    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn station(&self) -> &Arc<dyn StationHandle> {
        &self.station
    }

    /// Whether an analysis run or batch is in progress.
    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            warn!("event channel closed, dropping event");
        }
    }

    /// Decode one websocket text frame and act on it. Frames that cannot
    /// be decoded are answered with an `error` event.
    pub fn handle_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(Inbound::Command(command)) => self.handle(command),
            Ok(Inbound::Ignored) => debug!("frame ignored"),
            Err(e) => {
                warn!(error = %e, frame = text, "undecodable frame");
                self.emit(WorkerEvent::error(e.to_string()));
            }
        }
    }

    /// Must be called from within a Tokio runtime.
    pub fn handle(&self, command: WorkerCommand) {
        info!(command = command.name(), station = %self.station.kind(), "command received");
        if !self.station.supports(&command) {
            self.emit(unsupported(self.station.kind(), &command));
            return;
        }
        match command {
            WorkerCommand::GetStatus => self.query("get_status", |s| s.status()),
            WorkerCommand::GetArmStatus => self.query("get_arm_status", |s| s.arm_status()),
            WorkerCommand::GetInstrumentInfo => self.query("get_instrument_info", |s| s.instrument_info()),
            WorkerCommand::GetSequenceList => self.query("get_sequence_list", |s| s.sequence_list()),
            WorkerCommand::MoveTower => self.query("move_tower", |s| s.move_tower()),
            WorkerCommand::GetResult {
                bottle,
                sequence,
                archive_id,
            } => self.query("get_result", move |s| match s.results() {
                Some(q) => q.analysis_result(bottle, sequence, archive_id.as_deref()),
                None => WorkerEvent::error("未配置结果查询"),
            }),
            WorkerCommand::GetPeaks {
                sequence,
                relative_percent,
                archive_id,
            } => self.query("get_peaks", move |s| match s.results() {
                Some(q) => q.peaks(sequence, relative_percent, archive_id.as_deref()),
                None => WorkerEvent::error("未配置结果查询"),
            }),
            WorkerCommand::GetMassSpectrum {
                sequence,
                retention_time,
                archive_id,
            } => self.query("get_mass_spectrum", move |s| match s.results() {
                Some(q) => q.mass_spectrum(sequence, retention_time, archive_id.as_deref()),
                None => WorkerEvent::error("未配置结果查询"),
            }),
            WorkerCommand::StartAnalysis {
                bottle,
                sequence,
                task_id,
            } => self.start_analysis(bottle, sequence, task_id),
            WorkerCommand::RunBatch { batch, task_id } => self.run_batch(batch, task_id),
            WorkerCommand::ForceStop => self.force_stop(),
        }
    }

    fn query<F>(&self, command: &'static str, f: F)
    where
        F: FnOnce(&dyn StationHandle) -> WorkerEvent + Send + 'static,
    {
        let station = Arc::clone(&self.station);
        let this = self.clone();
        tokio::spawn(async move {
            let event = match tokio::task::spawn_blocking(move || f(station.as_ref())).await {
                Ok(event) => event,
                Err(e) => {
                    error!(command, error = %e, "query panicked");
                    WorkerEvent::error(format!("执行 {command} 时出错: {e}"))
                }
            };
            this.emit(event);
        });
    }

    /// Take the job slot, or explain who holds it.
    fn claim(&self, label: String, cancel: Option<CancelFlag>) -> Result<(), String> {
        let mut slot = self.slot();
        if let Some(job) = slot.as_ref() {
            return Err(job.label.clone());
        }
        *slot = Some(ActiveJob { label, cancel });
        Ok(())
    }

    fn release(&self) {
        *self.slot() = None;
    }

    fn start_analysis(&self, bottle: u32, sequence: Option<u32>, task_id: Option<String>) {
        let cancel = CancelFlag::new();
        if let Err(running) = self.claim(format!("瓶号 {bottle} 的分析"), Some(cancel.clone())) {
            warn!(bottle, %running, "analysis refused, station busy");
            self.emit(WorkerEvent::error(format!("{running}正在进行，请等待完成后再试")));
            return;
        }
        self.emit(WorkerEvent::AnalysisStarted {
            bottle_num: bottle,
            sequence_index: sequence,
            message: format!("已开始分析瓶号 {bottle}"),
            timestamp: local_timestamp(),
        });

        let this = self.clone();
        tokio::spawn(async move {
            let station = Arc::clone(&this.station);
            let events = this.events.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut sink = |stage: Stage, message: String| {
                    let _ = events.send(WorkerEvent::progress(bottle, sequence, stage, message));
                };
                station.run_analysis(bottle, sequence, &cancel, &mut sink)
            })
            .await;

            let (terminal, status, artifacts) = match outcome {
                Ok(Ok(archived)) => {
                    info!(bottle, archive_id = %archived.archive_id, "analysis archived");
                    let artifacts = json!({
                        "archive_id": archived.archive_id,
                        "bottle_num": bottle,
                        "sequence_index": sequence,
                    });
                    let event = WorkerEvent::AnalysisComplete {
                        bottle_num: bottle,
                        sequence_index: sequence,
                        archive_id: archived.archive_id,
                        message: format!("瓶号 {bottle} 分析完成，结果已归档"),
                        timestamp: local_timestamp(),
                    };
                    (event, TaskStatus::Completed, artifacts)
                }
                Ok(Err(e)) => {
                    error!(bottle, stage = ?e.stage(), error = %e, "analysis failed");
                    analysis_failure(bottle, sequence, &e)
                }
                Err(e) => {
                    error!(bottle, error = %e, "analysis thread panicked");
                    let message = format!("分析线程异常退出: {e}");
                    let event = WorkerEvent::AnalysisError {
                        bottle_num: bottle,
                        sequence_index: sequence,
                        stage: None,
                        message: message.clone(),
                        timestamp: local_timestamp(),
                    };
                    (event, TaskStatus::Failed, json!({ "error": message }))
                }
            };
            this.submit(task_id.as_deref(), status, artifacts).await;
            // A new job may start only once this one has been reported.
            this.emit(terminal);
            this.release();
        });
    }

    fn run_batch(&self, batch: BatchRequest, task_id: Option<String>) {
        if let Err(running) = self.claim(format!("试管 {} 的配料", batch.bottle_15ml_pos), None) {
            warn!(tube = batch.bottle_15ml_pos, %running, "batch refused, station busy");
            self.emit(WorkerEvent::BatchError {
                error: format!("{running}正在进行，请等待完成后再试"),
                request: request_value(&batch),
                timestamp: local_timestamp(),
            });
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let station = Arc::clone(&this.station);
            let request = batch.clone();
            let outcome = tokio::task::spawn_blocking(move || station.run_batch(&request)).await;

            let (terminal, status, artifacts) = match outcome {
                Ok(Ok(result)) => {
                    let value = batch_artifacts(&result);
                    let event = WorkerEvent::BatchComplete {
                        result: value.clone(),
                        timestamp: local_timestamp(),
                    };
                    (event, TaskStatus::Completed, value)
                }
                Ok(Err(e)) => {
                    error!(tube = batch.bottle_15ml_pos, error = %e, "batch failed");
                    batch_failure(&batch, e.to_string())
                }
                Err(e) => {
                    error!(tube = batch.bottle_15ml_pos, error = %e, "batch thread panicked");
                    batch_failure(&batch, format!("配料线程异常退出: {e}"))
                }
            };
            this.submit(task_id.as_deref(), status, artifacts).await;
            // A new job may start only once this one has been reported.
            this.emit(terminal);
            this.release();
        });
    }

    fn force_stop(&self) {
        let slot = self.slot();
        let message = match slot.as_ref() {
            Some(ActiveJob {
                label,
                cancel: Some(cancel),
            }) => {
                cancel.cancel();
                info!(job = %label, "stop requested");
                format!("已收到停止指令，{label}将在当前步骤结束后停止")
            }
            Some(ActiveJob { label, cancel: None }) => format!("{label}无法中途停止，请等待完成"),
            None => "当前没有正在运行的任务".to_string(),
        };
        drop(slot);
        self.emit(WorkerEvent::info(message));
    }

    async fn submit(&self, task_id: Option<&str>, status: TaskStatus, artifacts: Value) {
        let (Some(task_id), Some(store)) = (task_id, self.store.as_ref()) else {
            return;
        };
        match store.submit_task_result(task_id, status, artifacts).await {
            Ok(()) => info!(task_id, ?status, "task result submitted"),
            Err(e) => warn!(task_id, error = %e, "task result not submitted"),
        }
    }
}

fn analysis_failure(bottle: u32, sequence: Option<u32>, e: &StationError) -> (WorkerEvent, TaskStatus, Value) {
    let status = if e.is_cancelled() {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Failed
    };
    let stage = e.stage();
    let event = WorkerEvent::AnalysisError {
        bottle_num: bottle,
        sequence_index: sequence,
        stage,
        message: e.to_string(),
        timestamp: local_timestamp(),
    };
    let artifacts = json!({
        "error": e.to_string(),
        "stage": stage.map(Stage::label),
        "bottle_num": bottle,
    });
    (event, status, artifacts)
}

fn request_value(batch: &BatchRequest) -> Value {
    serde_json::to_value(batch).unwrap_or(Value::Null)
}

fn batch_failure(batch: &BatchRequest, error: String) -> (WorkerEvent, TaskStatus, Value) {
    let artifacts = json!({ "error": error, "request": request_value(batch) });
    let event = WorkerEvent::BatchError {
        error,
        request: request_value(batch),
        timestamp: local_timestamp(),
    };
    (event, TaskStatus::Failed, artifacts)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use lims_protocol::DeviceStatus;
    use lims_storage::{StorageError, TaskParameters};
    use tokio::sync::Notify;

    use super::*;
    use crate::station::StationKind;

    /// Dispensing-shaped station whose batches block until released.
    struct Gate {
        batches: AtomicUsize,
        open: CancelFlag,
    }

    impl StationHandle for Gate {
        fn kind(&self) -> StationKind {
            StationKind::Dispensing
        }

        fn supports(&self, command: &WorkerCommand) -> bool {
            !matches!(command, WorkerCommand::MoveTower)
        }

        fn status(&self) -> WorkerEvent {
            WorkerEvent::DeviceStatus {
                status: DeviceStatus {
                    arm: true,
                    balance: true,
                    powder_dispenser: true,
                    busy: false,
                },
                timestamp: local_timestamp(),
            }
        }

        fn run_batch(&self, batch: &BatchRequest) -> Result<lims_station::BatchOutcome, StationError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            // Wait (up to a minute) for the test to let the batch finish.
            lims_devices::Sleeper::sleep(&self.open, Duration::from_secs(60));
            Err(StationError::Unavailable(format!("tube {}", batch.bottle_15ml_pos)))
        }
    }

    fn setup() -> (Dispatcher, mpsc::UnboundedReceiver<WorkerEvent>, Arc<Gate>) {
        let gate = Arc::new(Gate {
            batches: AtomicUsize::new(0),
            open: CancelFlag::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(gate.clone(), tx), rx, gate)
    }

    fn batch(tube: u32) -> BatchRequest {
        BatchRequest {
            solids_list: vec![1.0],
            liquids_list: vec![],
            bottle_15ml_pos: tube,
            start_tip_pos: vec![],
        }
    }

    /// Task store whose submissions wait until `finish` is notified.
    #[derive(Default)]
    struct SlowStore {
        entered: Notify,
        finish: Notify,
    }

    #[async_trait]
    impl TaskStore for SlowStore {
        async fn submit_task_result(&self, _task_id: &str, _status: TaskStatus, _artifacts: Value) -> Result<(), StorageError> {
            self.entered.notify_one();
            self.finish.notified().await;
            Ok(())
        }

        async fn get_task_parameters(&self, task_id: &str) -> Result<TaskParameters, StorageError> {
            Err(StorageError::TaskNotFound {
                task_id: task_id.to_string(),
            })
        }
    }

    async fn until_idle(dispatcher: &Dispatcher) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.is_busy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job slot never released");
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn undecodable_frame_is_answered() {
        let (dispatcher, mut rx, _) = setup();
        dispatcher.handle_frame("start_analysis_x");
        match next(&mut rx).await {
            WorkerEvent::Error { message, .. } => assert!(message.contains("无法解析消息")),
            other => panic!("unexpected {other:?}"),
        }
        dispatcher.handle_frame(r#"{"message": "start_analysis_x"}"#);
        match next(&mut rx).await {
            WorkerEvent::Error { message, .. } => assert_eq!(message, "指令格式错误: start_analysis_x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_command_is_answered() {
        let (dispatcher, mut rx, _) = setup();
        dispatcher.handle(WorkerCommand::MoveTower);
        match next(&mut rx).await {
            WorkerEvent::Error { message, .. } => assert!(message.contains("move_tower")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_batch_is_refused_while_first_runs() {
        let (dispatcher, mut rx, gate) = setup();
        dispatcher.handle(WorkerCommand::RunBatch {
            batch: batch(1),
            task_id: None,
        });
        dispatcher.handle(WorkerCommand::RunBatch {
            batch: batch(2),
            task_id: None,
        });
        match next(&mut rx).await {
            WorkerEvent::BatchError { error, request, .. } => {
                assert!(error.contains("试管 1"));
                assert_eq!(request["bottle_15ml_pos"], 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dispatcher.is_busy());

        // Batches cannot be stopped part way.
        dispatcher.handle(WorkerCommand::ForceStop);
        match next(&mut rx).await {
            WorkerEvent::Info { message, .. } => assert!(message.contains("无法中途停止")),
            other => panic!("unexpected {other:?}"),
        }

        gate.open.cancel();
        match next(&mut rx).await {
            WorkerEvent::BatchError { error, .. } => assert_eq!(error, "tube 1"),
            other => panic!("unexpected {other:?}"),
        }
        until_idle(&dispatcher).await;
        assert_eq!(gate.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slot_is_held_until_the_outcome_is_reported() {
        let gate = Arc::new(Gate {
            batches: AtomicUsize::new(0),
            open: CancelFlag::new(),
        });
        gate.open.cancel();
        let store = Arc::new(SlowStore::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(gate.clone(), tx).with_task_store(store.clone());

        dispatcher.handle(WorkerCommand::RunBatch {
            batch: batch(1),
            task_id: Some("t-1".into()),
        });
        store.entered.notified().await;

        // The batch itself is over but its result is still being submitted.
        assert!(dispatcher.is_busy());
        dispatcher.handle(WorkerCommand::RunBatch {
            batch: batch(2),
            task_id: None,
        });
        match next(&mut rx).await {
            WorkerEvent::BatchError { error, request, .. } => {
                assert!(error.contains("试管 1"));
                assert_eq!(request["bottle_15ml_pos"], 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        store.finish.notify_one();
        match next(&mut rx).await {
            WorkerEvent::BatchError { error, .. } => assert_eq!(error, "tube 1"),
            other => panic!("unexpected {other:?}"),
        }
        until_idle(&dispatcher).await;
        assert_eq!(gate.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_stop_without_a_job() {
        let (dispatcher, mut rx, _) = setup();
        dispatcher.handle(WorkerCommand::ForceStop);
        match next(&mut rx).await {
            WorkerEvent::Info { message, .. } => assert_eq!(message, "当前没有正在运行的任务"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn station_without_analysis_reports_an_analysis_error() {
        let (dispatcher, mut rx, _) = setup();
        dispatcher.handle(WorkerCommand::StartAnalysis {
            bottle: 3,
            sequence: None,
            task_id: None,
        });
        assert!(matches!(next(&mut rx).await, WorkerEvent::AnalysisStarted { bottle_num: 3, .. }));
        match next(&mut rx).await {
            WorkerEvent::AnalysisError { stage, message, .. } => {
                assert_eq!(stage, None);
                assert!(message.contains("不支持分析任务"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
