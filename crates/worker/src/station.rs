//! The station a worker drives, seen through one interface.
//!
//! Every method is blocking and is called from a blocking thread. Query
//! methods always produce an event; failures become event fields, not
//! errors, so the requester gets an answer either way.

use lims_devices::registry::try_acquire;
use lims_devices::{CancelFlag, SharedArm};
use lims_instruments::{GcmsControl, HplcControl, InstrumentError};
use lims_protocol::{local_timestamp, BatchRequest, DeviceStatus, WorkerCommand, WorkerEvent};
use lims_station::{
    BatchOutcome, DispensingStation, GcmsStation, HplcStation, InstrumentStatus, ProgressSink, ResultQueries,
    StationError,
};
use lims_storage::ArchivedResult;
use serde_json::json;
use tracing::warn;

/// Arm register read back by `get_arm_status`.
const ARM_STATUS_REGISTER: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationKind {
    Gcms,
    Hplc,
    Dispensing,
}

impl StationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StationKind::Gcms => "gcms",
            StationKind::Hplc => "hplc",
            StationKind::Dispensing => "gypl",
        }
    }
}

impl std::fmt::Display for StationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn unsupported(kind: StationKind, command: &WorkerCommand) -> WorkerEvent {
    WorkerEvent::error(format!("{kind} 工站不支持指令 {}", command.name()))
}

pub trait StationHandle: Send + Sync + 'static {
    fn kind(&self) -> StationKind;

    /// Whether this station answers `command` at all.
    fn supports(&self, command: &WorkerCommand) -> bool;

    fn status(&self) -> WorkerEvent;

    fn arm(&self) -> Option<&SharedArm> {
        None
    }

    fn arm_status(&self) -> WorkerEvent {
        match self.arm() {
            Some(arm) => arm_status(arm),
            None => unsupported(self.kind(), &WorkerCommand::GetArmStatus),
        }
    }

    fn instrument_info(&self) -> WorkerEvent {
        unsupported(self.kind(), &WorkerCommand::GetInstrumentInfo)
    }

    fn sequence_list(&self) -> WorkerEvent {
        unsupported(self.kind(), &WorkerCommand::GetSequenceList)
    }

    fn move_tower(&self) -> WorkerEvent {
        unsupported(self.kind(), &WorkerCommand::MoveTower)
    }

    fn run_analysis(
        &self,
        _bottle: u32,
        _sequence: Option<u32>,
        _cancel: &CancelFlag,
        _sink: &mut dyn ProgressSink,
    ) -> Result<ArchivedResult, StationError> {
        Err(StationError::Unavailable(format!("{} 工站不支持分析任务", self.kind())))
    }

    fn results(&self) -> Option<&ResultQueries> {
        None
    }

    fn run_batch(&self, _batch: &BatchRequest) -> Result<BatchOutcome, StationError> {
        Err(StationError::Unavailable(format!("{} 工站不支持配料任务", self.kind())))
    }

    /// Connectivity of the station's devices, for periodic reporting.
    fn device_status(&self) -> Option<DeviceStatus> {
        None
    }
}

/// Connection check plus a register read. A disconnected arm is reported,
/// not treated as a failure of the query. An arm held by a running step is
/// reported busy without waiting for it.
pub fn arm_status(arm: &SharedArm) -> WorkerEvent {
    let Some(mut arm) = try_acquire(arm) else {
        return WorkerEvent::ArmStatus {
            connected: true,
            b_value: None,
            servo_enabled: None,
            robot_mode: None,
            error: None,
            busy: true,
            timestamp: local_timestamp(),
        };
    };
    if !arm.is_connected() {
        return WorkerEvent::ArmStatus {
            connected: false,
            b_value: None,
            servo_enabled: None,
            robot_mode: None,
            error: Some("机械臂未连接".into()),
            busy: false,
            timestamp: local_timestamp(),
        };
    }
    let (b_value, error) = match arm.get_b(ARM_STATUS_REGISTER) {
        Ok(v) => (Some(v), None),
        Err(e) => {
            warn!(error = %e, "arm register read failed");
            (None, Some(e.to_string()))
        }
    };
    WorkerEvent::ArmStatus {
        connected: true,
        b_value,
        servo_enabled: arm.get_servo_status(),
        robot_mode: arm.get_robot_mode(),
        error,
        busy: false,
        timestamp: local_timestamp(),
    }
}

fn status_event(status: Result<InstrumentStatus, InstrumentError>) -> WorkerEvent {
    match status {
        Ok(s) => WorkerEvent::StatusUpdate {
            status: s.status,
            run_status: s.run_status,
            run_mode: s.run_mode,
            error: None,
            timestamp: local_timestamp(),
        },
        Err(e) => {
            warn!(error = %e, "instrument status unavailable");
            WorkerEvent::StatusUpdate {
                status: "连接失败".into(),
                run_status: "Unknown".into(),
                run_mode: "Unknown".into(),
                error: Some(e.to_string()),
                timestamp: local_timestamp(),
            }
        }
    }
}

fn info_event(info: Result<serde_json::Value, InstrumentError>) -> WorkerEvent {
    match info {
        Ok(info) => WorkerEvent::InstrumentInfo {
            info,
            timestamp: local_timestamp(),
        },
        Err(e) => WorkerEvent::error(format!("获取仪器信息失败: {e}")),
    }
}

fn analysis_commands(command: &WorkerCommand) -> bool {
    matches!(
        command,
        WorkerCommand::GetStatus
            | WorkerCommand::GetArmStatus
            | WorkerCommand::GetInstrumentInfo
            | WorkerCommand::StartAnalysis { .. }
            | WorkerCommand::GetResult { .. }
            | WorkerCommand::ForceStop
    )
}

// ──────────────────────────────────────────────
// GC-MS
// ──────────────────────────────────────────────

pub struct GcmsHandle<C> {
    station: GcmsStation<C>,
    results: ResultQueries,
}

impl<C: GcmsControl + Sync + 'static> GcmsHandle<C> {
    pub fn new(station: GcmsStation<C>, results: ResultQueries) -> Self {
        Self { station, results }
    }
}

impl<C: GcmsControl + Sync + 'static> StationHandle for GcmsHandle<C> {
    fn kind(&self) -> StationKind {
        StationKind::Gcms
    }

    fn supports(&self, command: &WorkerCommand) -> bool {
        // Every command except dispensing batches.
        !matches!(command, WorkerCommand::RunBatch { .. })
    }

    fn status(&self) -> WorkerEvent {
        status_event(self.station.status())
    }

    fn arm(&self) -> Option<&SharedArm> {
        Some(self.station.arm())
    }

    fn instrument_info(&self) -> WorkerEvent {
        info_event(self.station.instrument_info())
    }

    fn sequence_list(&self) -> WorkerEvent {
        WorkerEvent::SequenceList {
            sequences: self.station.sequences(),
            timestamp: local_timestamp(),
        }
    }

    fn move_tower(&self) -> WorkerEvent {
        match self.station.move_tower() {
            Ok(()) => WorkerEvent::TowerMoved {
                message: "GCMS塔已移动到位".into(),
                timestamp: local_timestamp(),
            },
            Err(e) => WorkerEvent::error(format!("移动GCMS塔失败: {e}")),
        }
    }

    fn run_analysis(
        &self,
        bottle: u32,
        sequence: Option<u32>,
        cancel: &CancelFlag,
        sink: &mut dyn ProgressSink,
    ) -> Result<ArchivedResult, StationError> {
        self.station.run_analysis(bottle, sequence, cancel, sink)
    }

    fn results(&self) -> Option<&ResultQueries> {
        Some(&self.results)
    }
}

// ──────────────────────────────────────────────
// HPLC
// ──────────────────────────────────────────────

pub struct HplcHandle<H> {
    station: HplcStation<H>,
    results: ResultQueries,
}

impl<H: HplcControl + 'static> HplcHandle<H> {
    pub fn new(station: HplcStation<H>, results: ResultQueries) -> Self {
        Self { station, results }
    }
}

impl<H: HplcControl + 'static> StationHandle for HplcHandle<H> {
    fn kind(&self) -> StationKind {
        StationKind::Hplc
    }

    fn supports(&self, command: &WorkerCommand) -> bool {
        analysis_commands(command)
    }

    fn status(&self) -> WorkerEvent {
        status_event(self.station.status())
    }

    fn arm(&self) -> Option<&SharedArm> {
        Some(self.station.arm())
    }

    fn instrument_info(&self) -> WorkerEvent {
        info_event(self.station.instrument_info())
    }

    /// The HPLC exports no sequence number; the sequence is ignored.
    fn run_analysis(
        &self,
        bottle: u32,
        _sequence: Option<u32>,
        cancel: &CancelFlag,
        sink: &mut dyn ProgressSink,
    ) -> Result<ArchivedResult, StationError> {
        self.station.run_analysis(bottle, cancel, sink)
    }

    fn results(&self) -> Option<&ResultQueries> {
        Some(&self.results)
    }
}

// ──────────────────────────────────────────────
// Dispensing
// ──────────────────────────────────────────────

pub struct DispensingHandle {
    station: DispensingStation,
}

impl DispensingHandle {
    pub fn new(station: DispensingStation) -> Self {
        Self { station }
    }

    pub fn station(&self) -> &DispensingStation {
        &self.station
    }
}

impl StationHandle for DispensingHandle {
    fn kind(&self) -> StationKind {
        StationKind::Dispensing
    }

    fn supports(&self, command: &WorkerCommand) -> bool {
        matches!(
            command,
            WorkerCommand::GetStatus
                | WorkerCommand::GetArmStatus
                | WorkerCommand::RunBatch { .. }
                | WorkerCommand::ForceStop
        )
    }

    fn status(&self) -> WorkerEvent {
        WorkerEvent::DeviceStatus {
            status: self.station.device_status(),
            timestamp: local_timestamp(),
        }
    }

    fn arm(&self) -> Option<&SharedArm> {
        Some(self.station.arm())
    }

    fn run_batch(&self, batch: &BatchRequest) -> Result<BatchOutcome, StationError> {
        self.station.run_full_batch(batch)
    }

    fn device_status(&self) -> Option<DeviceStatus> {
        Some(self.station.device_status())
    }
}

/// Artifacts stored with a finished batch.
pub fn batch_artifacts(outcome: &BatchOutcome) -> serde_json::Value {
    serde_json::to_value(outcome).unwrap_or_else(|_| json!({}))
}
