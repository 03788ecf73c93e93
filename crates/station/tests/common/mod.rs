//! Stand-ins shared by the station tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lims_devices::arm::{ArmConfig, ArmDriver};
use lims_devices::testing::{SimulatedArm, SimulatedBalancePort};
use lims_devices::{Balance, BalanceConfig, NoSleep, SharedArm, SharedBalance};
use lims_instruments::{GcmsControl, HplcControl, HplcCredentials, InstrumentError};
use serde_json::{json, Value};

pub fn arm(programs: &[&str]) -> (SimulatedArm, SharedArm) {
    let sim = SimulatedArm::new();
    sim.add_instant_programs(programs);
    let mut driver = ArmDriver::with_connector(ArmConfig::default(), Box::new(sim.clone()), Arc::new(NoSleep));
    assert!(driver.connect());
    (sim, Arc::new(Mutex::new(driver)))
}

pub fn balance() -> (SimulatedBalancePort, SharedBalance) {
    let port = SimulatedBalancePort::new();
    let balance = Balance::with_link(BalanceConfig::default(), Box::new(port.clone()), Arc::new(NoSleep));
    (port, Arc::new(Mutex::new(balance)))
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, call: impl Into<String>) {
    log.lock().unwrap().push(call.into());
}

/// GC-MS control that reports `Run` for a scripted number of polls.
pub struct FakeGcms {
    pub log: CallLog,
    modes: Mutex<VecDeque<String>>,
}

impl FakeGcms {
    pub fn new(busy_polls: usize) -> Self {
        let mut modes: VecDeque<String> = std::iter::repeat("Run".to_string()).take(busy_polls).collect();
        modes.push_back("NotRun".into());
        Self {
            log: CallLog::default(),
            modes: Mutex::new(modes),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl GcmsControl for FakeGcms {
    fn status(&self) -> Result<String, InstrumentError> {
        Ok("Idle".into())
    }

    fn run_status(&self) -> Result<String, InstrumentError> {
        Ok("Ready".into())
    }

    fn run_mode(&self) -> Result<String, InstrumentError> {
        record(&self.log, "run_mode");
        let mut modes = self.modes.lock().unwrap();
        let mode = if modes.len() > 1 { modes.pop_front() } else { modes.front().cloned() };
        Ok(mode.unwrap_or_else(|| "NotRun".into()))
    }

    fn model(&self) -> Result<String, InstrumentError> {
        Ok("5977B".into())
    }

    fn laboratory(&self) -> Result<String, InstrumentError> {
        Ok("Lab1".into())
    }

    fn move_tower(&self, position: u32, bottle: u32) -> Result<String, InstrumentError> {
        record(&self.log, format!("move_tower:{position}:{bottle}"));
        Ok("OK".into())
    }

    fn start_acquisition_file(&self, path: &str, index: u32, rename: bool) -> Result<String, InstrumentError> {
        record(&self.log, format!("start:{path}:{index}:{rename}"));
        Ok("OK".into())
    }
}

/// HPLC events API that exports `export` into `share` when the run
/// starts and reports idle after `busy_polls` checks.
pub struct FakeHplc {
    pub log: CallLog,
    pub share: PathBuf,
    pub export: Option<String>,
    busy_polls: Arc<Mutex<usize>>,
    logged_in: bool,
}

impl FakeHplc {
    pub fn new(log: CallLog, share: PathBuf, export: Option<&str>, busy_polls: Arc<Mutex<usize>>) -> Self {
        Self {
            log,
            share,
            export: export.map(str::to_string),
            busy_polls,
            logged_in: false,
        }
    }

    fn call(&self, name: &str) -> Result<(), InstrumentError> {
        if !self.logged_in {
            return Err(InstrumentError::NotLoggedIn);
        }
        record(&self.log, name);
        Ok(())
    }
}

impl HplcControl for FakeHplc {
    fn login(&mut self, credentials: &HplcCredentials) -> Result<(), InstrumentError> {
        record(&self.log, format!("login:{}", credentials.username));
        self.logged_in = true;
        Ok(())
    }

    fn system_info(&self) -> Result<Value, InstrumentError> {
        self.call("system_info")?;
        Ok(json!({"runStatus": "Idle", "runMode": "Idle"}))
    }

    fn instrument_info(&self, _cds_id: u32) -> Result<Value, InstrumentError> {
        self.call("instrument_info")?;
        Ok(json!({"name": "LC-1"}))
    }

    fn batch_set_samples(&self, _lims_data: &Value) -> Result<(), InstrumentError> {
        self.call("batch_set_samples")
    }

    fn samples_by_batch(&self, _batch_id: &str) -> Result<Value, InstrumentError> {
        self.call("samples_by_batch")?;
        Ok(json!([]))
    }

    fn active_workplans(&self, _is_active: u32, _lab_name: &str) -> Result<Value, InstrumentError> {
        self.call("active_workplans")?;
        Ok(json!([]))
    }

    fn generate_workplan(&self, _no: &str, _lab: &str, _samples: &Value) -> Result<(), InstrumentError> {
        self.call("generate_workplan")
    }

    fn remove_workplan_item(&self, _item_id: &str) -> Result<(), InstrumentError> {
        self.call("remove_workplan_item")
    }

    fn ready_to_place(&self, _cds_id: u32, _injector_id: &str) -> Result<Value, InstrumentError> {
        self.call("ready_to_place")?;
        Ok(Value::Null)
    }

    fn apply_place_position(&self, _cds_id: u32, _injector_id: &str, pos: &str) -> Result<Value, InstrumentError> {
        self.call(&format!("apply_place_position:{pos}"))?;
        Ok(Value::Null)
    }

    fn place_complete(&self, _cds_id: u32, _injector_id: &str, _vials: &Value) -> Result<(), InstrumentError> {
        self.call("place_complete")
    }

    fn start_analysis(&self, _cds_id: u32, _job: &Value) -> Result<(), InstrumentError> {
        self.call("start_analysis")?;
        if let Some(name) = &self.export {
            let dir = self.share.join("run");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(name), "x,y\n0.1,5\n0.2,7\n").unwrap();
        }
        Ok(())
    }

    fn check_idle(&self, _cds_id: u32) -> Result<bool, InstrumentError> {
        self.call("check_idle")?;
        let mut busy = self.busy_polls.lock().unwrap();
        if *busy == 0 {
            Ok(true)
        } else {
            *busy -= 1;
            Ok(false)
        }
    }

    fn ready_to_clear(&self, _cds_id: u32, _injector_id: &str) -> Result<Value, InstrumentError> {
        self.call("ready_to_clear")?;
        Ok(Value::Null)
    }

    fn apply_clear_position(&self, _cds_id: u32, _injector_id: &str, pos: &str) -> Result<Value, InstrumentError> {
        self.call(&format!("apply_clear_position:{pos}"))?;
        Ok(Value::Null)
    }

    fn clear_complete(&self, _cds_id: u32, _injector_id: &str, positions: &Value) -> Result<(), InstrumentError> {
        assert_eq!(positions[0]["positionIndex"], -1);
        self.call("clear_complete")
    }
}
