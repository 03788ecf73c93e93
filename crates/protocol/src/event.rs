//! Events a station worker publishes back through the relay.
//!
//! Every event is wrapped in [`crate::envelope::WorkerMessage`] before it is
//! sent, and carries a local `YYYY-MM-DD HH:MM:SS` timestamp.

use serde::{Serialize, Serializer};
use serde_json::Value;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::model::{DeviceStatus, Peak, RobotMode, SequenceEntry, Series};

/// Stages of one analysis run, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Started,
    Preparing,
    ArmLoad,
    Acquisition,
    AwaitCompletion,
    Reset,
    ArmUnload,
    Finished,
}

impl Stage {
    pub const ORDER: [Stage; 8] = [
        Stage::Started,
        Stage::Preparing,
        Stage::ArmLoad,
        Stage::Acquisition,
        Stage::AwaitCompletion,
        Stage::Reset,
        Stage::ArmUnload,
        Stage::Finished,
    ];

    /// Label shown to operators. Both arm stages share one label.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Started => "任务开始",
            Stage::Preparing => "设备准备",
            Stage::ArmLoad | Stage::ArmUnload => "机械臂操作",
            Stage::Acquisition => "仪器分析",
            Stage::AwaitCompletion => "等待分析完成",
            Stage::Reset => "设备复位",
            Stage::Finished => "完成",
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `YYYY-MM-DD HH:MM:SS` in local time (UTC when the offset is unknown).
pub fn local_timestamp() -> String {
    now_local()
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_default()
}

/// `YYYYmmdd_HHMMSS`, the prefix of every archive id.
pub fn archive_stamp() -> String {
    now_local()
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    WorkerConnected {
        station: String,
        timestamp: String,
    },
    StatusUpdate {
        status: String,
        run_status: String,
        run_mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: String,
    },
    ArmStatus {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        b_value: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        servo_enabled: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        robot_mode: Option<RobotMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Set while a running step holds the arm; nothing was read.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        busy: bool,
        timestamp: String,
    },
    DeviceStatus {
        status: DeviceStatus,
        timestamp: String,
    },
    InstrumentInfo {
        info: Value,
        timestamp: String,
    },
    SequenceList {
        sequences: Vec<SequenceEntry>,
        timestamp: String,
    },
    TowerMoved {
        message: String,
        timestamp: String,
    },
    AnalysisStarted {
        bottle_num: u32,
        sequence_index: Option<u32>,
        message: String,
        timestamp: String,
    },
    AnalysisProgress {
        bottle_num: u32,
        sequence_index: Option<u32>,
        stage: Stage,
        message: String,
        timestamp: String,
    },
    AnalysisComplete {
        bottle_num: u32,
        sequence_index: Option<u32>,
        archive_id: String,
        message: String,
        timestamp: String,
    },
    AnalysisError {
        bottle_num: u32,
        sequence_index: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        message: String,
        timestamp: String,
    },
    AnalysisResult {
        bottle_num: Option<u32>,
        sequence_index: Option<u32>,
        archive_id: Option<String>,
        available: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        series: Option<Series>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: String,
    },
    MassSpectrumResult {
        sequence_index: u32,
        requested_rt: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        retention_time: Option<f64>,
        archive_id: Option<String>,
        available: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        series: Option<Series>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: String,
    },
    PeaksResult {
        sequence_index: u32,
        archive_id: Option<String>,
        relative_area_percent: f64,
        available: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data_folder: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        peaks: Vec<Peak>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: String,
    },
    BatchComplete {
        result: Value,
        timestamp: String,
    },
    BatchError {
        error: String,
        request: Value,
        timestamp: String,
    },
    Info {
        message: String,
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
}

impl WorkerEvent {
    pub fn info(message: impl Into<String>) -> Self {
        WorkerEvent::Info {
            message: message.into(),
            timestamp: local_timestamp(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WorkerEvent::Error {
            message: message.into(),
            timestamp: local_timestamp(),
        }
    }

    pub fn progress(bottle_num: u32, sequence_index: Option<u32>, stage: Stage, message: impl Into<String>) -> Self {
        WorkerEvent::AnalysisProgress {
            bottle_num,
            sequence_index,
            stage,
            message: message.into(),
            timestamp: local_timestamp(),
        }
    }

    /// True for the events that end an analysis run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::AnalysisComplete { .. } | WorkerEvent::AnalysisError { .. }
        )
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
