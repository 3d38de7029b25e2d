//! Persisted tables.
//!
//! The station tables of one aggregation run are all kept in a single CSV file, an *artifact*,
//! whose name records the resolution and the range covered:
//! `fin-traffic-<resolution>-<begin>-<end>.csv`, e.g. `fin-traffic-1h-20200101T0000-20200401T0000.csv`.
//! Each row is one [`CountCell`] of one station, identified by the station's key.
//!
//! While a run is in progress, the artifact has an additional `.partial` suffix. It only gets its
//! final name once every station has been written, so a crashed run leaves a `.partial` file
//! behind (for inspection) and never an artifact claiming coverage it doesn't have.
//!
//! Area flows are kept the same way, in `tms-between-<area level>-<resolution>-<begin>-<end>.csv`.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDateTime;
use csv::WriterBuilder;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{station_from_key, StationCountTable},
    merge::{AreaFlowTable, FlowCell},
    topology::AreaLevel,
    window::{CountCell, TimeWindow},
    Direction, FlowError, Resolution, StationId, VehicleCategory,
};

pub const ARTIFACT_PREFIX: &str = "fin-traffic-";
pub const FLOW_PREFIX: &str = "tms-between-";
pub const PARTIAL_SUFFIX: &str = ".partial";
const DATETIME_FORMAT: &str = "%Y%m%dT%H%M";

/// The resolution and range of the tables in an artifact, as recorded in its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactName {
    pub resolution: Resolution,
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ArtifactName {
    pub fn file_name(&self) -> String {
        format!("{ARTIFACT_PREFIX}{}.csv", self.coverage())
    }

    pub fn partial_file_name(&self) -> String {
        format!("{}{PARTIAL_SUFFIX}", self.file_name())
    }

    /// The file name of area flows derived from this artifact.
    pub fn flow_file_name(&self, level: AreaLevel) -> String {
        format!("{FLOW_PREFIX}{level}-{}.csv", self.coverage())
    }

    fn coverage(&self) -> String {
        format!(
            "{}-{}-{}",
            self.resolution,
            self.begin.format(DATETIME_FORMAT),
            self.end.format(DATETIME_FORMAT)
        )
    }

    pub fn from_file_name(name: &str) -> Result<Self, FlowError> {
        let invalid = || FlowError::InvalidName(name.to_string());

        let parts: Vec<&str> = name
            .strip_prefix(ARTIFACT_PREFIX)
            .and_then(|v| v.strip_suffix(".csv"))
            .ok_or_else(invalid)?
            .split('-')
            .collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let resolution = parts[0].parse().map_err(|_| invalid())?;
        let begin =
            NaiveDateTime::parse_from_str(parts[1], DATETIME_FORMAT).map_err(|_| invalid())?;
        let end =
            NaiveDateTime::parse_from_str(parts[2], DATETIME_FORMAT).map_err(|_| invalid())?;
        if begin >= end {
            return Err(invalid());
        }

        Ok(Self {
            resolution,
            begin,
            end,
        })
    }
}

/// List the (finished) artifacts in a directory.
///
/// Files that don't start with [`ARTIFACT_PREFIX`] and `.partial` files are ignored.
pub fn list_artifacts(dir: &Path) -> Result<Vec<(ArtifactName, PathBuf)>, FlowError> {
    let mut artifacts = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(ARTIFACT_PREFIX) || name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        artifacts.push((ArtifactName::from_file_name(&name)?, entry.path()));
    }
    artifacts.sort_by_key(|(name, _)| (name.begin, name.end));
    Ok(artifacts)
}

/// A row of a station artifact.
#[derive(Debug, Serialize, Deserialize)]
struct StationRow {
    key: String,
    window_begin: NaiveDateTime,
    window_end: NaiveDateTime,
    direction: u8,
    category: u8,
    count: u32,
}

/// A row of an area flow file.
#[derive(Debug, Serialize, Deserialize)]
struct FlowRow {
    key: String,
    window_begin: NaiveDateTime,
    window_end: NaiveDateTime,
    category: u8,
    count: u32,
}

/// Writes station tables into one artifact file, from any number of threads.
///
/// The file is only reachable through the lock, which is held for the write of one table.
#[derive(Debug)]
pub struct ArtifactWriter {
    file: Mutex<File>,
}

impl ArtifactWriter {
    /// Create a new artifact file (with header), replacing any existing one.
    pub fn create(path: &Path) -> Result<Self, FlowError> {
        let mut file = File::create(path)?;
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(vec![]);
        wtr.write_record([
            "key",
            "window_begin",
            "window_end",
            "direction",
            "category",
            "count",
        ])?;
        file.write_all(&into_bytes(wtr)?)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Open an existing artifact file to append tables to it.
    pub fn append_to(path: &Path) -> Result<Self, FlowError> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one station's table.
    ///
    /// Rows are serialized before taking the lock, and written with a single write.
    pub fn append(&self, table: &StationCountTable) -> Result<(), FlowError> {
        let key = table.key();
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(vec![]);
        for cell in &table.cells {
            wtr.serialize(StationRow {
                key: key.clone(),
                window_begin: cell.window.begin,
                window_end: cell.window.end,
                direction: cell.direction.num(),
                category: cell.category.num(),
                count: cell.count,
            })?;
        }
        let bytes = into_bytes(wtr)?;

        let mut file = self.file.lock().map_err(|_| FlowError::WriterPoisoned)?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// Sync the file to disk and close it.
    pub fn finish(self) -> Result<(), FlowError> {
        let file = self
            .file
            .into_inner()
            .map_err(|_| FlowError::WriterPoisoned)?;
        file.sync_all()?;
        Ok(())
    }
}

fn into_bytes(wtr: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, FlowError> {
    wtr.into_inner()
        .map_err(|e| FlowError::Io(e.into_error()))
}

/// Give a finished `.partial` file its final name.
pub fn promote(partial: &Path, final_path: &Path) -> Result<(), FlowError> {
    fs::rename(partial, final_path)?;
    debug!("Promoted {partial:?} to {final_path:?}.");
    Ok(())
}

/// Rewrite an artifact without the tables of `stations`.
///
/// Returns the number of rows removed.
pub fn remove_stations(path: &Path, stations: &HashSet<StationId>) -> Result<usize, FlowError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let header = rdr.headers()?.clone();
    let mut kept = vec![];
    let mut removed = 0;
    for row in rdr.records() {
        let row = row?;
        let station = row.get(0).and_then(station_from_key);
        if station.is_some_and(|s| stations.contains(&s)) {
            removed += 1;
        } else {
            kept.push(row);
        }
    }
    drop(rdr);

    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(&header)?;
    for row in &kept {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    debug!("Removed {removed} rows of {} station(s) from {path:?}.", stations.len());
    Ok(removed)
}

/// Read all station tables of an artifact.
///
/// Cells of each table are ordered by window, direction and category, regardless of the order
/// in which they were appended.
pub fn read_station_tables(
    path: &Path,
    resolution: Resolution,
) -> Result<HashMap<StationId, StationCountTable>, FlowError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut tables: HashMap<StationId, StationCountTable> = HashMap::new();

    for row in rdr.deserialize() {
        let row: StationRow = row?;
        let station =
            station_from_key(&row.key).ok_or_else(|| FlowError::InvalidName(row.key.clone()))?;
        let cell = CountCell {
            window: TimeWindow {
                begin: row.window_begin,
                end: row.window_end,
            },
            direction: Direction::from_num(row.direction)?,
            category: VehicleCategory::from_num(row.category)?,
            count: row.count,
        };
        tables
            .entry(station)
            .and_modify(|t| t.cells.push(cell))
            .or_insert(StationCountTable {
                station,
                resolution,
                cells: vec![cell],
            });
    }

    for table in tables.values_mut() {
        table
            .cells
            .sort_by_key(|c| (c.window.begin, c.direction, c.category));
    }
    Ok(tables)
}

/// The stations that have a table in an artifact.
pub fn artifact_stations(path: &Path) -> Result<HashSet<StationId>, FlowError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut stations = HashSet::new();
    for row in rdr.deserialize() {
        let row: StationRow = row?;
        let station =
            station_from_key(&row.key).ok_or_else(|| FlowError::InvalidName(row.key.clone()))?;
        stations.insert(station);
    }
    Ok(stations)
}

/// Read-only access to station tables, by station.
pub trait StationTableStore {
    fn station_table(&self, station: StationId) -> Option<&StationCountTable>;
}

impl StationTableStore for HashMap<StationId, StationCountTable> {
    fn station_table(&self, station: StationId) -> Option<&StationCountTable> {
        self.get(&station)
    }
}

/// The tables of an artifact file, loaded into memory.
#[derive(Debug)]
pub struct ArtifactStore {
    pub name: ArtifactName,
    tables: HashMap<StationId, StationCountTable>,
}

impl ArtifactStore {
    pub fn open(path: &Path) -> Result<Self, FlowError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| FlowError::InvalidName(format!("{path:?}")))?
            .to_string_lossy();
        let name = ArtifactName::from_file_name(&file_name)?;
        let tables = read_station_tables(path, name.resolution)?;
        debug!("Loaded {} station tables from {path:?}.", tables.len());
        Ok(Self { name, tables })
    }
}

impl StationTableStore for ArtifactStore {
    fn station_table(&self, station: StationId) -> Option<&StationCountTable> {
        self.tables.get(&station)
    }
}

/// Write area flow tables, keyed by edge, to `path`.
///
/// The file is written under a `.partial` name first and renamed when complete.
pub fn write_flow_tables(
    path: &Path,
    tables: &BTreeMap<String, AreaFlowTable>,
) -> Result<(), FlowError> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    let mut wtr = csv::Writer::from_path(&partial)?;
    for (key, table) in tables {
        for cell in &table.cells {
            wtr.serialize(FlowRow {
                key: key.clone(),
                window_begin: cell.window.begin,
                window_end: cell.window.end,
                category: cell.category.num(),
                count: cell.count,
            })?;
        }
    }
    wtr.flush()?;
    drop(wtr);

    promote(&partial, path)
}

/// Read area flow tables written by [`write_flow_tables`].
pub fn read_flow_tables(
    path: &Path,
    resolution: Resolution,
) -> Result<BTreeMap<String, AreaFlowTable>, FlowError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut tables: BTreeMap<String, AreaFlowTable> = BTreeMap::new();

    for row in rdr.deserialize() {
        let row: FlowRow = row?;
        let cell = FlowCell {
            window: TimeWindow {
                begin: row.window_begin,
                end: row.window_end,
            },
            category: VehicleCategory::from_num(row.category)?,
            count: row.count,
        };
        tables
            .entry(row.key.clone())
            .or_insert_with(|| AreaFlowTable {
                key: row.key.clone(),
                resolution,
                cells: vec![],
            })
            .cells
            .push(cell);
    }
    Ok(tables)
}
