use lims_devices::DeviceError;
use lims_instruments::InstrumentError;
use lims_protocol::Stage;
use lims_storage::StorageError;

/// Failures of a station procedure or result query.
///
/// Analysis-run variants carry the [`Stage`] that was running, so the
/// worker can tell the operator where the physical system stopped.
#[derive(Debug, thiserror::Error)]
pub enum StationError {
    #[error("逻辑位置必须是正整数: {0}")]
    InvalidPosition(i64),

    #[error("加液失败：没有可用的枪头。")]
    NoTipsAvailable,

    /// A dispensing-batch step failed on the arm or balance.
    #[error("{step}: {source}")]
    Dispensing {
        step: String,
        #[source]
        source: DeviceError,
    },

    #[error("{stage}: {source}")]
    Device {
        stage: Stage,
        #[source]
        source: DeviceError,
    },

    #[error("{stage}: {source}")]
    Instrument {
        stage: Stage,
        #[source]
        source: InstrumentError,
    },

    #[error("{stage}: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },

    #[error("{stage}: {message}")]
    Procedure { stage: Stage, message: String },

    #[error("任务已取消 ({stage})")]
    Cancelled { stage: Stage },

    /// Archive lookups outside a run.
    #[error(transparent)]
    Archive(#[from] StorageError),

    /// Instrument-side services used by result queries.
    #[error(transparent)]
    Service(#[from] InstrumentError),

    /// The request cannot be answered from the archive.
    #[error("{0}")]
    Unavailable(String),
}

impl StationError {
    /// Stage an analysis run was in when it failed.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StationError::Device { stage, .. }
            | StationError::Instrument { stage, .. }
            | StationError::Storage { stage, .. }
            | StationError::Procedure { stage, .. }
            | StationError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StationError::Cancelled { .. })
    }
}
