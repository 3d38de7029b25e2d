use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use traffic_flows::{
    coordinator::{Coordinator, RunOutcome, RunReport},
    merge::merge,
    raw::{list_chunks, CsvEventSource},
    store::{read_flow_tables, read_station_tables, write_flow_tables, ArtifactStore},
    topology::{read_station_roster, AreaLevel},
    window::{TailPolicy, WindowGrid},
    FlowError, Resolution, StationId, VehicleCategory,
};

const RAW_DIR: &str = "test_files/raw";
const REFERENCE_DIR: &str = "test_files/reference";

fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}

fn temp_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "traffic-flows-area-flows-{test}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn run(output_dir: &Path, begin: &str, end: &str) -> RunReport {
    let chunks = list_chunks(Path::new(RAW_DIR)).unwrap();
    let stations =
        read_station_roster(&Path::new(REFERENCE_DIR).join("stations.csv")).unwrap();
    let coordinator = Coordinator {
        workers: 3,
        ..Default::default()
    };
    match coordinator
        .run(
            &CsvEventSource::new(RAW_DIR),
            &chunks,
            &stations,
            output_dir,
            dt(begin),
            dt(end),
            "1h".parse().unwrap(),
        )
        .unwrap()
    {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyCovered(..) => panic!("nothing was aggregated"),
    }
}

#[test]
fn flows_between_areas_correct() {
    let dir = temp_dir("flows");
    let report = run(&dir, "2020-01-01 00:00", "2020-01-03 00:00");
    assert_eq!(report.aggregated, 3);
    assert!(report.failed.is_empty());

    let store = ArtifactStore::open(&report.path).unwrap();
    let topology = AreaLevel::Hcd
        .load_topology(Path::new(REFERENCE_DIR))
        .unwrap();
    let grid = WindowGrid::new(
        store.name.begin,
        store.name.end,
        store.name.resolution,
        TailPolicy::ShortFinal,
    )
    .unwrap();

    let flows = merge(&topology, &store, &grid).unwrap();
    assert_eq!(flows.len(), 3);

    let a_b = &flows["A:B"];
    assert_eq!(a_b.cells.len(), 48 * 7);
    assert_eq!(a_b.total(), 9);
    let midnight = dt("2020-01-01 00:00");
    assert_eq!(a_b.count(midnight, VehicleCategory::Car), Some(3));
    assert_eq!(
        a_b.count(midnight, VehicleCategory::TruckWithoutTrailer),
        Some(4)
    );
    assert_eq!(
        a_b.count(dt("2020-01-02 00:00"), VehicleCategory::Car),
        Some(1)
    );

    let b_a = &flows["B:A"];
    assert_eq!(b_a.total(), 3);
    assert_eq!(
        b_a.count(dt("2020-01-01 18:00"), VehicleCategory::Car),
        Some(1)
    );
    assert_eq!(
        b_a.count(dt("2020-01-02 13:00"), VehicleCategory::Bus),
        Some(1)
    );

    let b_c = &flows["B:C"];
    assert_eq!(b_c.total(), 1);
    assert_eq!(
        b_c.count(dt("2020-01-01 09:00"), VehicleCategory::CarWithCaravan),
        Some(1)
    );

    // Written and read back.
    let flow_path = dir.join(store.name.flow_file_name(AreaLevel::Hcd));
    write_flow_tables(&flow_path, &flows).unwrap();
    assert_eq!(
        flow_path.file_name().unwrap().to_string_lossy(),
        "tms-between-hcd-1h-20200101T0000-20200103T0000.csv"
    );
    let read_back = read_flow_tables(&flow_path, store.name.resolution).unwrap();
    assert_eq!(read_back, flows);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn extended_artifact_same_as_aggregating_at_once() {
    let at_once = temp_dir("at-once");
    let in_steps = temp_dir("in-steps");
    let resolution: Resolution = "1h".parse().unwrap();

    let whole = run(&at_once, "2020-01-01 00:00", "2020-01-03 00:00");
    let first = run(&in_steps, "2020-01-01 00:00", "2020-01-02 00:00");
    let extended = run(&in_steps, "2020-01-01 00:00", "2020-01-03 00:00");

    assert_eq!(extended.extended, Some(first.artifact));
    assert_eq!(extended.artifact, whole.artifact);
    assert!(!first.path.exists());

    let whole: HashMap<StationId, _> = read_station_tables(&whole.path, resolution).unwrap();
    let extended = read_station_tables(&extended.path, resolution).unwrap();
    assert_eq!(whole, extended);

    fs::remove_dir_all(&at_once).unwrap();
    fs::remove_dir_all(&in_steps).unwrap();
}

#[test]
fn merge_errs_if_station_not_aggregated() {
    let dir = temp_dir("missing");
    let chunks = list_chunks(Path::new(RAW_DIR)).unwrap();
    // Only 3 and 7, not 12.
    let RunOutcome::Completed(report) = Coordinator::default()
        .run(
            &CsvEventSource::new(RAW_DIR),
            &chunks,
            &[3, 7],
            &dir,
            dt("2020-01-01 00:00"),
            dt("2020-01-02 00:00"),
            "1h".parse().unwrap(),
        )
        .unwrap()
    else {
        panic!("nothing was aggregated");
    };

    let store = ArtifactStore::open(&report.path).unwrap();
    let topology = AreaLevel::Hcd
        .load_topology(Path::new(REFERENCE_DIR))
        .unwrap();
    let grid = WindowGrid::new(
        store.name.begin,
        store.name.end,
        store.name.resolution,
        TailPolicy::ShortFinal,
    )
    .unwrap();

    assert!(matches!(
        merge(&topology, &store, &grid),
        Err(FlowError::MissingStation { station: 12, .. })
    ));

    // A grid for another range doesn't match the artifact's tables.
    let other = WindowGrid::new(
        dt("2020-01-01 00:00"),
        dt("2020-01-03 00:00"),
        store.name.resolution,
        TailPolicy::ShortFinal,
    )
    .unwrap();
    let a_b = topology.edge("A", "B").unwrap();
    assert!(matches!(
        traffic_flows::merge::merge_edge(a_b, &store, &other),
        Err(FlowError::TableMismatch { .. })
    ));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn coordinates_and_dot_ok() {
    let coordinates = AreaLevel::Hcd
        .load_coordinates(Path::new(REFERENCE_DIR))
        .unwrap();
    assert_eq!(coordinates.len(), 3);
    let topology = AreaLevel::Hcd
        .load_topology(Path::new(REFERENCE_DIR))
        .unwrap();
    let dot = topology.to_dot(&coordinates);
    assert!(dot.contains("\"C\" [pos=\"25.5,65!\"];"));
    assert!(dot.contains("\"B\" -> \"C\" [label=\"12,1\"];"));
}
