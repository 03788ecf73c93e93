//! GC-MS station: the arm loads a vial onto the instrument tower, a
//! sequence runs, the vial comes back and the result CSV is archived.

use std::path::PathBuf;
use std::time::Duration;

use lims_devices::{CancelFlag, SharedArm};
use lims_instruments::{is_not_run, GcmsControl, InstrumentError};
use lims_protocol::{SequenceEntry, Stage};
use lims_storage::{ArchivedResult, ResultArchive, SequenceCatalog};
use serde_json::{json, Value};

use crate::error::StationError;
use crate::run::{run_arm_programs, ProgressSink, RunContext};

const PROG_LOAD: &str = "kb_to_gcms";
const PROG_UNLOAD: &str = "gc_drop";

#[derive(Debug, Clone)]
pub struct GcmsSettings {
    /// Sequence started when a run names no sequence number.
    pub default_sequence_file: String,
    /// Result CSV written by the default sequence, if known.
    pub default_result_csv: Option<PathBuf>,
    /// File name of the result CSV inside a run's `.D` folder.
    pub result_file_name: String,
    pub tower_position: u32,
    pub tower_bottle: u32,
}

impl Default for GcmsSettings {
    fn default() -> Self {
        Self {
            default_sequence_file: "2024 Dec 04 1403_default.sequence.xml".to_string(),
            default_result_csv: None,
            result_file_name: "tic_front.csv".to_string(),
            tower_position: 0,
            tower_bottle: 1,
        }
    }
}

/// Waits between the steps of a run.
#[derive(Debug, Clone)]
pub struct GcmsTiming {
    pub step_settle: Duration,
    pub acquisition_settle: Duration,
    pub run_poll: Duration,
    pub reset_settle: Duration,
    pub tower_settle: Duration,
    pub result_poll: Duration,
    pub result_attempts: u32,
}

impl Default for GcmsTiming {
    fn default() -> Self {
        Self {
            step_settle: Duration::from_secs(1),
            acquisition_settle: Duration::from_secs(5),
            run_poll: Duration::from_secs(10),
            reset_settle: Duration::from_secs(5),
            tower_settle: Duration::from_secs(2),
            result_poll: Duration::from_secs(2),
            result_attempts: 30,
        }
    }
}

impl GcmsTiming {
    /// No waiting at all; for tests and simulations.
    pub fn immediate() -> Self {
        Self {
            step_settle: Duration::ZERO,
            acquisition_settle: Duration::ZERO,
            run_poll: Duration::ZERO,
            reset_settle: Duration::ZERO,
            tower_settle: Duration::ZERO,
            result_poll: Duration::ZERO,
            result_attempts: 3,
        }
    }
}

/// Instrument state as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentStatus {
    pub status: String,
    pub run_status: String,
    pub run_mode: String,
}

pub struct GcmsStation<C> {
    instrument: C,
    arm: SharedArm,
    catalog: SequenceCatalog,
    archive: ResultArchive,
    settings: GcmsSettings,
    timing: GcmsTiming,
}

impl<C: GcmsControl> GcmsStation<C> {
    pub fn new(instrument: C, arm: SharedArm, catalog: SequenceCatalog, archive: ResultArchive) -> Self {
        Self {
            instrument,
            arm,
            catalog,
            archive,
            settings: GcmsSettings::default(),
            timing: GcmsTiming::default(),
        }
    }

    pub fn with_settings(mut self, settings: GcmsSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_timing(mut self, timing: GcmsTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn instrument(&self) -> &C {
        &self.instrument
    }

    pub fn arm(&self) -> &SharedArm {
        &self.arm
    }

    pub fn catalog(&self) -> &SequenceCatalog {
        &self.catalog
    }

    pub fn archive(&self) -> &ResultArchive {
        &self.archive
    }

    pub fn sequences(&self) -> Vec<SequenceEntry> {
        self.catalog.entries()
    }

    pub fn status(&self) -> Result<InstrumentStatus, InstrumentError> {
        let run_status = self.instrument.run_status()?;
        let run_mode = self.instrument.run_mode()?;
        let status = if is_not_run(&run_mode) { "就绪" } else { "运行中" };
        Ok(InstrumentStatus {
            status: status.to_string(),
            run_status,
            run_mode,
        })
    }

    pub fn instrument_info(&self) -> Result<Value, InstrumentError> {
        Ok(json!({
            "model": self.instrument.model()?,
            "laboratory": self.instrument.laboratory()?,
        }))
    }

    pub fn move_tower(&self) -> Result<(), InstrumentError> {
        self.instrument
            .move_tower(self.settings.tower_position, self.settings.tower_bottle)
            .map(|_| ())
    }

    /// Where the run for `sequence` writes its result CSV.
    fn result_path(&self, sequence: Option<u32>) -> Option<PathBuf> {
        match sequence {
            Some(index) => self.catalog.result_csv(index, &self.settings.result_file_name),
            None => self.settings.default_result_csv.clone(),
        }
    }

    /// Run bottle `bottle` through the instrument and archive its result.
    ///
    /// Emits the stages in order through `sink`. A cancelled run stops at the
    /// next stage boundary or wait; the step in progress is not interrupted.
    pub fn run_analysis(
        &self,
        bottle: u32,
        sequence: Option<u32>,
        cancel: &CancelFlag,
        sink: &mut dyn ProgressSink,
    ) -> Result<ArchivedResult, StationError> {
        let mut ctx = RunContext::new(cancel, sink);
        let t = &self.timing;

        ctx.enter(Stage::Started, format!("开始分析瓶号 {bottle}"))?;
        // Resolve the sequence before anything moves.
        let sequence_file = match sequence {
            Some(index) => self
                .catalog
                .sequence_file(index)
                .map(str::to_string)
                .ok_or_else(|| ctx.failed(format!("未找到序列号 {index} 对应的序列文件")))?,
            None => self.settings.default_sequence_file.clone(),
        };

        ctx.enter(Stage::Preparing, "移动GCMS塔...")?;
        self.move_tower().map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.step_settle)?;

        ctx.enter(Stage::ArmLoad, format!("机械臂夹取 {bottle} 号瓶至GCMS"))?;
        run_arm_programs(&self.arm, bottle, &[PROG_LOAD]).map_err(|e| ctx.device(e))?;
        ctx.wait(t.step_settle)?;

        ctx.enter(Stage::Acquisition, "GCMS开始执行分析序列...")?;
        self.instrument
            .start_acquisition_file(&sequence_file, 0, true)
            .map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.acquisition_settle)?;

        ctx.enter(Stage::AwaitCompletion, "GCMS运行中，请稍候...")?;
        loop {
            let mode = self.instrument.run_mode().map_err(|e| ctx.instrument(e))?;
            if is_not_run(&mode) {
                break;
            }
            ctx.wait(t.run_poll)?;
        }

        ctx.enter(Stage::Reset, "分析完成，准备复位设备")?;
        ctx.wait(t.reset_settle)?;
        self.move_tower().map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.tower_settle)?;

        ctx.enter(Stage::ArmUnload, format!("机械臂取回 {bottle} 号瓶"))?;
        run_arm_programs(&self.arm, bottle, &[PROG_UNLOAD]).map_err(|e| ctx.device(e))?;

        let result = self
            .result_path(sequence)
            .ok_or_else(|| ctx.failed("未配置结果文件路径，无法归档"))?;
        let mut found = false;
        for attempt in 0..t.result_attempts.max(1) {
            if result.is_file() {
                found = true;
                break;
            }
            if attempt + 1 < t.result_attempts {
                ctx.wait(t.result_poll)?;
            }
        }
        if !found {
            return Err(ctx.failed(format!("未找到结果文件: {}", result.display())));
        }

        let label = match sequence {
            Some(index) => format!("seq{index}"),
            None => format!("b{bottle}"),
        };
        let archived = self
            .archive
            .archive(&result, &label, result.parent().filter(|p| !p.as_os_str().is_empty()))
            .map_err(|e| ctx.storage(e))?;

        ctx.finish(format!("瓶号 {bottle} 分析完成"));
        Ok(archived)
    }
}
