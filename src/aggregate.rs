//! Aggregate the raw events of a station into counts per window, direction and category.
use std::collections::HashMap;

use chrono::NaiveDateTime;
use log::debug;

use crate::{
    raw::{EventCursor, EventSource, SourceChunk},
    window::{CountCell, TimeWindow, WindowGrid},
    Direction, FlowError, Resolution, StationId, VehicleCategory,
};

/// The counts of one station over a [`WindowGrid`].
///
/// Every window/direction/category combination of the grid is present, ordered as in
/// [`WindowGrid::empty_template`]; combinations without any vehicles have a count of 0.
#[derive(Debug, Clone, PartialEq)]
pub struct StationCountTable {
    pub station: StationId,
    pub resolution: Resolution,
    pub cells: Vec<CountCell>,
}

impl StationCountTable {
    /// The key the table is stored under.
    pub fn key(&self) -> String {
        station_key(self.station)
    }

    /// The windows of the table, in order.
    pub fn windows(&self) -> Vec<TimeWindow> {
        let mut windows: Vec<TimeWindow> = vec![];
        for cell in &self.cells {
            if windows.last() != Some(&cell.window) {
                windows.push(cell.window);
            }
        }
        windows
    }

    /// Count for a particular window (by its beginning), direction and category.
    pub fn count(
        &self,
        window_begin: NaiveDateTime,
        direction: Direction,
        category: VehicleCategory,
    ) -> Option<u32> {
        self.cells
            .iter()
            .find(|c| {
                c.window.begin == window_begin && c.direction == direction && c.category == category
            })
            .map(|c| c.count)
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().map(|c| c.count as u64).sum()
    }
}

/// The key a station's table is stored under, e.g. "tms_3".
pub fn station_key(station: StationId) -> String {
    format!("tms_{station}")
}

/// Get the station back from a key created by [`station_key`].
pub fn station_from_key(key: &str) -> Option<StationId> {
    key.strip_prefix("tms_")?.parse().ok()
}

/// Identifies the window and lane direction for binning vehicles.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
struct BinnedCountKey {
    window_begin: NaiveDateTime,
    direction: Direction,
    category: VehicleCategory,
}

/// Count the vehicles of `station` in each window of `grid`.
///
/// `chunks` must be ordered, without overlap or gaps. Vehicles flagged as faulty and vehicles
/// outside the grid are not counted. A station without any vehicles in any chunk gets a table
/// of zeros.
pub fn aggregate<S: EventSource + ?Sized>(
    source: &S,
    station: StationId,
    grid: &WindowGrid,
    chunks: &[SourceChunk],
) -> Result<StationCountTable, FlowError> {
    let mut counts: HashMap<BinnedCountKey, u32> = HashMap::new();
    let mut total = 0;

    for event in EventCursor::new(source, station, chunks) {
        let event = event?;
        if !event.valid || event.station != station {
            continue;
        }
        let Some(index) = grid.window_of(event.timestamp) else {
            continue;
        };
        let key = BinnedCountKey {
            window_begin: grid.windows()[index].begin,
            direction: event.direction,
            category: event.category,
        };
        counts.entry(key).and_modify(|c| *c += 1).or_insert(1);
        total += 1;
    }

    // Fill in the counts on top of the full grid of zeros.
    let mut cells = grid.empty_template();
    for cell in cells.iter_mut() {
        let key = BinnedCountKey {
            window_begin: cell.window.begin,
            direction: cell.direction,
            category: cell.category,
        };
        if let Some(count) = counts.get(&key) {
            cell.count = *count;
        }
    }

    debug!(
        "Aggregated {total} vehicles for station {station} into {} windows.",
        grid.len()
    );

    Ok(StationCountTable {
        station,
        resolution: grid.resolution(),
        cells,
    })
}
