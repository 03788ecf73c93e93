//! Stations built on simulated hardware for the worker tests.
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lims_devices::arm::{ArmConfig, ArmDriver};
use lims_devices::testing::{SimulatedArm, SimulatedBalancePort};
use lims_devices::{Balance, BalanceConfig, NoSleep, SharedArm};
use lims_instruments::{GcmsControl, InstrumentError};
use lims_protocol::WorkerEvent;
use lims_station::{DispensingStation, GcmsStation, GcmsTiming, ResultQueries};
use lims_storage::{ResultArchive, SequenceCatalog};
use lims_worker::{DispensingHandle, GcmsHandle};
use tokio::sync::mpsc;

pub const GCMS_PROGRAMS: &[&str] = &["kb_to_gcms", "gc_drop"];

pub const DISPENSING_PROGRAMS: &[&str] = &[
    "guticl_ning_shiguan",
    "shiguan_back",
    "guticl_ning_shaobei",
    "shaobei_back",
    "guticl_pick_tip",
    "guticl_remove_tip",
    "guticl_suck_shaobei_to_tp",
    "guticl_fentong_take",
    "guticl_fentong_back",
];

pub fn arm(programs: &[&str]) -> (SimulatedArm, SharedArm) {
    let sim = SimulatedArm::new();
    sim.add_instant_programs(programs);
    let mut driver = ArmDriver::with_connector(ArmConfig::default(), Box::new(sim.clone()), Arc::new(NoSleep));
    assert!(driver.connect());
    (sim, Arc::new(Mutex::new(driver)))
}

/// GC-MS that stays in `Run` until [`FakeGcms::finish`] is called.
#[derive(Clone, Default)]
pub struct FakeGcms {
    running: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

impl FakeGcms {
    pub fn hold(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
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
        let running = self.started() && self.running.load(Ordering::SeqCst);
        Ok(if running { "Run" } else { "NotRun" }.into())
    }

    fn model(&self) -> Result<String, InstrumentError> {
        Ok("5977B".into())
    }

    fn laboratory(&self) -> Result<String, InstrumentError> {
        Ok("Lab1".into())
    }

    fn move_tower(&self, _position: u32, _bottle: u32) -> Result<String, InstrumentError> {
        Ok("OK".into())
    }

    fn start_acquisition_file(&self, _path: &str, _index: u32, _rename: bool) -> Result<String, InstrumentError> {
        self.started.store(true, Ordering::SeqCst);
        Ok("OK".into())
    }
}

/// A GC-MS station whose sequence 1 writes `data/run1.D/tic_front.csv`.
pub fn gcms(tmp: &Path, instrument: FakeGcms) -> (SimulatedArm, GcmsHandle<FakeGcms>) {
    let data = tmp.join("data");
    let run_dir = data.join("run1.D");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(run_dir.join("tic_front.csv"), "x,y\n1.0,10\n1.1,12\n").unwrap();

    let catalog = SequenceCatalog::parse("1: 甲苯.sequence.xml\n").with_params(&format!(
        "index,sequence_file,data_name,data_path\n1,甲苯.sequence.xml,run1,{}\n",
        data.display()
    ));
    let archive = ResultArchive::open(tmp.join("archive")).unwrap();
    let (sim, arm) = arm(GCMS_PROGRAMS);
    let timing = GcmsTiming {
        run_poll: Duration::from_millis(10),
        ..GcmsTiming::immediate()
    };
    let station = GcmsStation::new(instrument, arm, catalog.clone(), archive.clone()).with_timing(timing);
    (sim, GcmsHandle::new(station, ResultQueries::new(archive, catalog)))
}

pub fn dispensing() -> (SimulatedArm, SimulatedBalancePort, DispensingHandle) {
    let (sim, arm) = arm(DISPENSING_PROGRAMS);
    let port = SimulatedBalancePort::new();
    let balance = Balance::with_link(BalanceConfig::default(), Box::new(port.clone()), Arc::new(NoSleep));
    let station = DispensingStation::new(arm, Arc::new(Mutex::new(balance)), Arc::new(NoSleep));
    (sim, port, DispensingHandle::new(station))
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip events until one matches.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
    mut wanted: impl FnMut(&WorkerEvent) -> bool,
) -> WorkerEvent {
    loop {
        let event = next_event(rx).await;
        if wanted(&event) {
            return event;
        }
    }
}

/// Wait until the dispatcher has released its job slot.
pub async fn until_idle(dispatcher: &lims_worker::Dispatcher) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job slot never released");
}
