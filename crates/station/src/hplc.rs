//! HPLC station: register the sample, place the vial through the
//! instrument's workplan, run, then pick the exported CSV off the share.
//!
//! Every run and every status query opens its own instrument session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lims_devices::{CancelFlag, SharedArm};
use lims_instruments::{HplcControl, HplcCredentials, InstrumentError, ShareWatcher};
use lims_protocol::{Series, Stage};
use lims_storage::{ArchivedResult, ResultArchive, StorageError};
use serde_json::{json, Value};

use crate::error::StationError;
use crate::gcms::InstrumentStatus;
use crate::run::{run_arm_programs, ProgressSink, RunContext};

const PROG_TAKE: &str = "ssx_take_bottle";
const PROG_OPEN_DOOR: &str = "ssx_open_door";
const PROG_RETURN: &str = "ssx_lose_bottle";

/// Results above this many points are thinned before they go on the wire.
pub const SERIES_THRESHOLD: usize = 8000;
pub const SERIES_TARGET: usize = 2000;

#[derive(Debug, Clone)]
pub struct HplcSettings {
    pub credentials: HplcCredentials,
    pub cds_id: u32,
    pub injector_id: String,
    /// Tray position the vial is placed at.
    pub position: String,
    pub work_plan_no: String,
    pub is_active: u32,
    pub lab_name: String,
    pub batch_id: String,
    /// Share the data system exports result CSVs to.
    pub remote_data: PathBuf,
    /// Local directory fetched CSVs are copied into.
    pub local_data: PathBuf,
    pub lims_data: Value,
    pub samples: Value,
    pub placed_vials: Value,
    pub analysis_job: Value,
}

impl Default for HplcSettings {
    fn default() -> Self {
        let batch_id = "20240619135729";
        let sample = json!({
            "barCode": format!("{batch_id}-1"),
            "type": "Sample",
            "name": "石脑油1",
            "status": "New",
            "batchId": batch_id,
            "vialList": [{
                "type": "Vial",
                "barCode": "",
                "labName": "Lab1",
                "analysisProject": "testLC",
                "status": "New",
            }],
        });
        let position = "D1B-A9".to_string();
        Self {
            credentials: HplcCredentials {
                username: "admin".into(),
                password: "agilent".into(),
            },
            cds_id: 17,
            injector_id: "18df4f9d-01c9-4fed-bca7-f12db5febac4".into(),
            placed_vials: json!([{
                "positionIndex": -1,
                "positionName": position,
                "vialBarcode": "",
                "placeOnInstrumentDateTime": "",
            }]),
            position,
            work_plan_no: "1721207124".into(),
            is_active: 1,
            lab_name: "Lab1".into(),
            batch_id: batch_id.into(),
            remote_data: PathBuf::from(r"\\192.168.58.132\Data"),
            local_data: PathBuf::from("Data"),
            lims_data: json!({ "limsSamples": [sample.clone()] }),
            samples: json!([sample]),
            analysis_job: Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HplcTiming {
    /// Pause between consecutive API calls.
    pub step_settle: Duration,
    /// Tray travel after a place or clear position is applied.
    pub tray_settle: Duration,
    pub idle_poll: Duration,
    /// Tray return after clear-complete.
    pub tray_return: Duration,
}

impl Default for HplcTiming {
    fn default() -> Self {
        Self {
            step_settle: Duration::from_secs(2),
            tray_settle: Duration::from_secs(10),
            idle_poll: Duration::from_secs(20),
            tray_return: Duration::from_secs(60),
        }
    }
}

impl HplcTiming {
    pub fn immediate() -> Self {
        Self {
            step_settle: Duration::ZERO,
            tray_settle: Duration::ZERO,
            idle_poll: Duration::ZERO,
            tray_return: Duration::ZERO,
        }
    }
}

type Connector<H> = Box<dyn Fn() -> H + Send + Sync>;

pub struct HplcStation<H> {
    connect: Connector<H>,
    arm: SharedArm,
    archive: ResultArchive,
    settings: HplcSettings,
    timing: HplcTiming,
}

impl<H: HplcControl> HplcStation<H> {
    /// `connect` builds a fresh, logged-out client.
    pub fn new(
        connect: impl Fn() -> H + Send + Sync + 'static,
        arm: SharedArm,
        archive: ResultArchive,
    ) -> Self {
        Self {
            connect: Box::new(connect),
            arm,
            archive,
            settings: HplcSettings::default(),
            timing: HplcTiming::default(),
        }
    }

    pub fn with_settings(mut self, settings: HplcSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_timing(mut self, timing: HplcTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn settings(&self) -> &HplcSettings {
        &self.settings
    }

    pub fn arm(&self) -> &SharedArm {
        &self.arm
    }

    pub fn archive(&self) -> &ResultArchive {
        &self.archive
    }

    fn session(&self) -> Result<H, InstrumentError> {
        let mut client = (self.connect)();
        client.login(&self.settings.credentials)?;
        Ok(client)
    }

    pub fn status(&self) -> Result<InstrumentStatus, InstrumentError> {
        let info = self.session()?.system_info()?;
        Ok(status_from_system_info(&info))
    }

    pub fn instrument_info(&self) -> Result<Value, InstrumentError> {
        let client = self.session()?;
        Ok(json!({
            "system": client.system_info()?,
            "instrument": client.instrument_info(self.settings.cds_id)?,
        }))
    }

    /// Read an archived result, thinned for display.
    pub fn result_series(&self, archive_id: &str) -> Result<Series, StorageError> {
        Ok(self
            .archive
            .read_series(archive_id)?
            .decimated(SERIES_THRESHOLD, SERIES_TARGET))
    }

    /// Run bottle `bottle` and archive the CSV the data system exported for
    /// it. Only a CSV that appeared on the share during this run counts.
    pub fn run_analysis(
        &self,
        bottle: u32,
        cancel: &CancelFlag,
        sink: &mut dyn ProgressSink,
    ) -> Result<ArchivedResult, StationError> {
        let mut ctx = RunContext::new(cancel, sink);
        let s = &self.settings;
        let t = &self.timing;

        ctx.enter(Stage::Started, format!("开始分析瓶号 {bottle}"))?;

        ctx.enter(Stage::Preparing, "登录HPLC并检查仪器状态")?;
        let client = self.session().map_err(|e| ctx.instrument(e))?;
        client.system_info().map_err(|e| ctx.instrument(e))?;
        client
            .instrument_info(s.cds_id)
            .map_err(|e| ctx.instrument(e))?;
        let idle = client.check_idle(s.cds_id).map_err(|e| ctx.instrument(e))?;
        if !idle {
            tracing::warn!(cds_id = s.cds_id, "instrument busy before run");
        }
        ctx.wait(t.step_settle)?;

        ctx.enter(Stage::ArmLoad, format!("放置 {bottle} 号样品"))?;
        run_arm_programs(&self.arm, bottle, &[PROG_TAKE, PROG_OPEN_DOOR]).map_err(|e| ctx.device(e))?;
        ctx.wait(t.step_settle)?;

        ctx.enter(Stage::Acquisition, "HPLC 开始采集")?;
        let mut watcher = self.acquire(&client, &ctx)?;

        ctx.enter(Stage::AwaitCompletion, "HPLC运行中，请稍候...")?;
        let mut fetched: Option<PathBuf> = None;
        loop {
            let idle = client.check_idle(s.cds_id).map_err(|e| ctx.instrument(e))?;
            if let Some(path) = self.fetch_new(&mut watcher) {
                fetched = Some(path);
            }
            if idle {
                break;
            }
            ctx.wait(t.idle_poll)?;
        }

        ctx.enter(Stage::Reset, "清理进样位")?;
        self.clear(&client, &ctx)?;
        if let Some(path) = self.fetch_new(&mut watcher) {
            fetched = Some(path);
        }

        ctx.enter(Stage::ArmUnload, format!("取回 {bottle} 号样品"))?;
        run_arm_programs(&self.arm, bottle, &[PROG_RETURN]).map_err(|e| ctx.device(e))?;

        let result = fetched.ok_or_else(|| {
            ctx.failed(format!(
                "共享目录 {} 中未出现本次运行的结果文件",
                watcher.root().display()
            ))
        })?;
        let archived = self
            .archive
            .archive(&result, &format!("b{bottle}"), None)
            .map_err(|e| ctx.storage(e))?;

        ctx.finish(format!("瓶号 {bottle} 分析完成"));
        Ok(archived)
    }

    /// Register the sample, place it through the workplan and start the
    /// run. The share is listed just before the start.
    fn acquire(&self, client: &H, ctx: &RunContext<'_>) -> Result<ShareWatcher, StationError> {
        let s = &self.settings;
        let t = &self.timing;
        let step = |r: Result<(), InstrumentError>| -> Result<(), StationError> {
            r.map_err(|e| ctx.instrument(e))?;
            ctx.wait(t.step_settle)
        };

        step(client.batch_set_samples(&s.lims_data))?;
        step(client.samples_by_batch(&s.batch_id).map(drop))?;
        step(client.generate_workplan(&s.work_plan_no, &s.lab_name, &s.samples))?;
        step(client.active_workplans(s.is_active, &s.lab_name).map(drop))?;
        step(client.ready_to_place(s.cds_id, &s.injector_id).map(drop))?;
        client
            .apply_place_position(s.cds_id, &s.injector_id, &s.position)
            .map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.tray_settle)?;
        step(client.place_complete(s.cds_id, &s.injector_id, &s.placed_vials))?;

        let watcher = ShareWatcher::snapshot(&s.remote_data, ".csv");
        client
            .start_analysis(s.cds_id, &s.analysis_job)
            .map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.step_settle)?;
        Ok(watcher)
    }

    fn clear(&self, client: &H, ctx: &RunContext<'_>) -> Result<(), StationError> {
        let s = &self.settings;
        let t = &self.timing;
        client
            .ready_to_clear(s.cds_id, &s.injector_id)
            .map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.step_settle)?;
        client
            .apply_clear_position(s.cds_id, &s.injector_id, &s.position)
            .map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.tray_settle)?;
        let positions = json!([{
            "positionIndex": -1,
            "positionName": s.position,
            "vialBarcode": "",
        }]);
        client
            .clear_complete(s.cds_id, &s.injector_id, &positions)
            .map_err(|e| ctx.instrument(e))?;
        ctx.wait(t.tray_return)?;
        tracing::info!(position = %s.position, "托盘成功归置原位");
        Ok(())
    }

    /// Copy every new CSV off the share and return the last one copied.
    fn fetch_new(&self, watcher: &mut ShareWatcher) -> Option<PathBuf> {
        let mut last = None;
        for entry in watcher.poll_new() {
            if !is_csv(&entry) {
                continue;
            }
            match watcher.fetch(&entry, &self.settings.local_data) {
                Ok(local) => last = Some(local),
                Err(e) => tracing::warn!(entry = %entry.display(), error = %e, "share fetch failed"),
            }
        }
        last
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

fn text_field(info: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match info.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

/// Summarise a system-info payload the way operators see it. A payload
/// without a run mode is reported as unknown, never as idle.
pub fn status_from_system_info(info: &Value) -> InstrumentStatus {
    let run_status = text_field(info, &["runStatus", "systemStatus"]).unwrap_or_else(|| "Unknown".into());
    let run_mode = text_field(info, &["runMode", "mode"]).unwrap_or_else(|| "Unknown".into());
    let status = match run_mode.to_lowercase().as_str() {
        "notrun" | "idle" | "ready" => "就绪",
        "unknown" => "未知",
        _ => "运行中",
    };
    InstrumentStatus {
        status: status.to_string(),
        run_status,
        run_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_prefers_run_status_and_run_mode() {
        let s = status_from_system_info(&json!({"runStatus": "Idle", "systemStatus": "x", "runMode": "Run"}));
        assert_eq!(s.run_status, "Idle");
        assert_eq!(s.status, "运行中");

        let s = status_from_system_info(&json!({"systemStatus": "Ready", "mode": "Idle"}));
        assert_eq!(s.run_status, "Ready");
        assert_eq!(s.status, "就绪");

        let s = status_from_system_info(&json!({"runMode": "NotRun"}));
        assert_eq!(s.status, "就绪");
    }

    #[test]
    fn missing_or_unknown_mode_is_not_idle() {
        let s = status_from_system_info(&json!({}));
        assert_eq!(s.run_mode, "Unknown");
        assert_eq!(s.run_status, "Unknown");
        assert_eq!(s.status, "未知");

        let s = status_from_system_info(&json!({"runStatus": "Idle", "runMode": "unknown"}));
        assert_eq!(s.status, "未知");
    }

    #[test]
    fn default_placement_uses_configured_position() {
        let settings = HplcSettings::default();
        assert_eq!(settings.placed_vials[0]["positionName"], "D1B-A9");
        assert_eq!(settings.lims_data["limsSamples"][0]["batchId"], "20240619135729");
    }
}
