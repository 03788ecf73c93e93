mod common;

use std::fs;
use std::path::Path;

use lims_devices::testing::SimulatedArm;
use lims_devices::CancelFlag;
use lims_protocol::Stage;
use lims_station::{GcmsStation, GcmsTiming, StationError};
use lims_storage::{ResultArchive, SequenceCatalog};

const PROGRAMS: &[&str] = &["kb_to_gcms", "gc_drop"];

fn catalog(data: &Path) -> SequenceCatalog {
    SequenceCatalog::parse("1: 甲苯.sequence.xml\n2：空白.sequence.xml\n").with_params(&format!(
        "index,sequence_file,data_name,data_path\n1,甲苯.sequence.xml,run1,{}\n",
        data.display()
    ))
}

type Station = GcmsStation<common::FakeGcms>;

fn station(tmp: &Path, busy_polls: usize) -> (SimulatedArm, Station) {
    let (sim, arm) = common::arm(PROGRAMS);
    let archive = ResultArchive::open(tmp.join("archive")).unwrap();
    let station = GcmsStation::new(common::FakeGcms::new(busy_polls), arm, catalog(&tmp.join("data")), archive)
        .with_timing(GcmsTiming::immediate());
    (sim, station)
}

#[test]
fn run_walks_every_stage_and_archives_the_result() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("data").join("run1.D");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(run_dir.join("tic_front.csv"), "x,y\n1.0,10\n1.1,12\n").unwrap();

    let (arm, station) = station(tmp.path(), 2);
    let cancel = CancelFlag::new();
    let mut stages = Vec::new();
    let mut sink = |stage: Stage, _msg: String| stages.push(stage);
    let archived = station.run_analysis(4, Some(1), &cancel, &mut sink).unwrap();

    assert_eq!(
        stages,
        vec![
            Stage::Started,
            Stage::Preparing,
            Stage::ArmLoad,
            Stage::Acquisition,
            Stage::AwaitCompletion,
            Stage::Reset,
            Stage::ArmUnload,
            Stage::Finished,
        ]
    );
    assert!(archived.archive_id.ends_with("_seq1"));
    assert_eq!(archived.data_folder(), Some(run_dir.clone()));
    let series = station.archive().read_series(&archived.archive_id).unwrap();
    assert_eq!(series.y, vec![10.0, 12.0]);

    let calls = station.instrument().calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("move_tower")).count(), 2);
    assert!(calls.contains(&"start:甲苯.sequence.xml:0:true".to_string()));
    assert_eq!(calls.iter().filter(|c| *c == "run_mode").count(), 3);
    assert_eq!(arm.launch_log(), vec!["kb_to_gcms", "gc_drop"]);
    assert_eq!(arm.b_register(0), Some(4));
}

#[test]
fn unknown_sequence_fails_before_hardware_moves() {
    let tmp = tempfile::tempdir().unwrap();
    let (arm, station) = station(tmp.path(), 0);
    let cancel = CancelFlag::new();
    let mut sink = |_: Stage, _: String| {};
    let err = station.run_analysis(1, Some(9), &cancel, &mut sink).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Started));
    assert!(err.to_string().contains("未找到序列号 9"));
    assert!(station.instrument().calls().is_empty());
    assert!(arm.launch_log().is_empty());
}

#[test]
fn missing_result_file_is_reported_after_unload() {
    let tmp = tempfile::tempdir().unwrap();
    let (arm, station) = station(tmp.path(), 0);
    let cancel = CancelFlag::new();
    let mut sink = |_: Stage, _: String| {};
    match station.run_analysis(2, Some(1), &cancel, &mut sink) {
        Err(StationError::Procedure { stage, message }) => {
            assert_eq!(stage, Stage::ArmUnload);
            assert!(message.starts_with("未找到结果文件"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(arm.launch_log(), vec!["kb_to_gcms", "gc_drop"]);
}

#[test]
fn cancellation_stops_at_the_next_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let (arm, station) = station(tmp.path(), 0);
    let cancel = CancelFlag::new();
    let mut sink = |stage: Stage, _: String| {
        if stage == Stage::ArmLoad {
            cancel.cancel();
        }
    };
    let err = station.run_analysis(3, Some(1), &cancel, &mut sink).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.stage(), Some(Stage::ArmLoad));
    // The load already in flight finishes; acquisition never starts.
    assert_eq!(arm.launch_log(), vec!["kb_to_gcms"]);
    assert!(!station.instrument().calls().iter().any(|c| c.starts_with("start:")));
}

#[test]
fn status_follows_run_mode() {
    let tmp = tempfile::tempdir().unwrap();
    let (_arm, station) = station(tmp.path(), 1);
    assert_eq!(station.status().unwrap().status, "运行中");
    assert_eq!(station.status().unwrap().status, "就绪");
    let info = station.instrument_info().unwrap();
    assert_eq!(info["model"], "5977B");
    assert_eq!(station.sequences().len(), 2);
}
