//! Combine station tables into flows between areas.
//!
//! For each edge of the [`Topology`], the counts of every contributing station, in the direction
//! the edge names for it, are added up by window and vehicle category. The direction does not
//! carry over into the result: it is given by the edge.
use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use log::{debug, info};

use crate::{
    aggregate::StationCountTable,
    store::StationTableStore,
    topology::{Edge, Topology},
    window::{TimeWindow, WindowGrid},
    FlowError, Resolution, VehicleCategory,
};

/// The count of one window/category combination along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowCell {
    pub window: TimeWindow,
    pub category: VehicleCategory,
    pub count: u32,
}

/// The flow from one area into another, by window and category.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaFlowTable {
    /// "source:destination"
    pub key: String,
    pub resolution: Resolution,
    pub cells: Vec<FlowCell>,
}

impl AreaFlowTable {
    pub fn count(&self, window_begin: NaiveDateTime, category: VehicleCategory) -> Option<u32> {
        self.cells
            .iter()
            .find(|c| c.window.begin == window_begin && c.category == category)
            .map(|c| c.count)
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().map(|c| c.count as u64).sum()
    }
}

/// Merge the station tables in `store` along every edge of `topology`.
///
/// `grid` is the window grid (range and resolution) the station tables are expected to have.
/// Fails on the first edge that references a station without a table, or whose stations' tables
/// don't match the grid.
pub fn merge<T: StationTableStore + ?Sized>(
    topology: &Topology,
    store: &T,
    grid: &WindowGrid,
) -> Result<BTreeMap<String, AreaFlowTable>, FlowError> {
    let mut flows = BTreeMap::new();
    for edge in topology.edges() {
        let table = merge_edge(edge, store, grid)?;
        flows.insert(table.key.clone(), table);
    }
    info!("Merged station counts along {} edges.", flows.len());
    Ok(flows)
}

/// Merge the station tables contributing to one edge.
pub fn merge_edge<T: StationTableStore + ?Sized>(
    edge: &Edge,
    store: &T,
    grid: &WindowGrid,
) -> Result<AreaFlowTable, FlowError> {
    let key = edge.key();

    // Start from zeros for every window/category, keyed by window beginning and category.
    let mut flows: BTreeMap<(NaiveDateTime, VehicleCategory), FlowCell> = BTreeMap::new();
    for window in grid.windows() {
        for category in VehicleCategory::ALL {
            flows.insert(
                (window.begin, category),
                FlowCell {
                    window: *window,
                    category,
                    count: 0,
                },
            );
        }
    }

    for contributor in &edge.contributors {
        let table = store
            .station_table(contributor.station)
            .ok_or_else(|| FlowError::MissingStation {
                edge: key.clone(),
                station: contributor.station,
            })?;
        check_table(table, grid)?;

        for cell in table
            .cells
            .iter()
            .filter(|c| c.direction == contributor.direction)
        {
            if let Some(flow) = flows.get_mut(&(cell.window.begin, cell.category)) {
                flow.count += cell.count;
            }
        }
    }
    debug!(
        "Merged {} station(s) into edge {key}.",
        edge.contributors.len()
    );

    Ok(AreaFlowTable {
        key,
        resolution: grid.resolution(),
        cells: flows.into_values().collect(),
    })
}

/// Ensure a station table has exactly the windows of the grid.
fn check_table(table: &StationCountTable, grid: &WindowGrid) -> Result<(), FlowError> {
    let mismatch = |problem: String| FlowError::TableMismatch {
        key: table.key(),
        problem,
    };

    if table.resolution != grid.resolution() {
        return Err(mismatch(format!(
            "resolution is {}, expected {}",
            table.resolution,
            grid.resolution()
        )));
    }

    let windows = table.windows();
    if windows != grid.windows() {
        let range = |w: &[TimeWindow]| match (w.first(), w.last()) {
            (Some(first), Some(last)) => format!("[{}, {})", first.begin, last.end),
            _ => "empty".to_string(),
        };
        return Err(mismatch(format!(
            "covers {} in {} windows, expected {} in {} windows",
            range(&windows),
            windows.len(),
            range(grid.windows()),
            grid.len()
        )));
    }

    if table.cells.len() != grid.empty_template().len() {
        return Err(mismatch(format!(
            "has {} cells, expected {}",
            table.cells.len(),
            grid.empty_template().len()
        )));
    }
    Ok(())
}
