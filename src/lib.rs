//! Aggregate per-vehicle records from traffic measurement stations (TMS) into time-binned
//! counts, and those counts into directed flows between areas.
//!
//! Work happens in two stages:
//!  1. [Time aggregation](aggregate): the raw records of one station, spread across dated
//!     [source chunks](raw::SourceChunk), are binned into a dense [grid](window) of
//!     [`CountCell`](window::CountCell)s, one per window, [`Direction`] and [`VehicleCategory`].
//!     The [coordinator] runs this for every station in parallel, all workers appending to one
//!     shared [artifact](store).
//!  2. [Area aggregation](merge): the station tables are combined along the edges of a
//!     [`Topology`](topology::Topology) into one [`AreaFlowTable`](merge::AreaFlowTable) per
//!     ordered pair of areas.
use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use thiserror::Error;

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod merge;
pub mod raw;
pub mod store;
pub mod topology;
pub mod window;

/// Number of a traffic measurement station.
pub type StationId = u32;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unable to parse date/time: {0}")]
    DateTime(#[from] chrono::ParseError),
    #[error("unable to load environment variable `{0}`")]
    MissingEnvVar(String),
    #[error("invalid value `{value}` for `{name}`")]
    InvalidConfig { name: String, value: String },
    #[error("no such direction code '{0}'")]
    BadDirection(u8),
    #[error("no such vehicle category '{0}'")]
    BadVehicleCategory(u8),
    #[error("invalid time resolution `{0}`")]
    InvalidResolution(String),
    #[error("invalid time range: {begin} is not before {end}")]
    InvalidRange {
        begin: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("the name `{0}` is not in the expected form")]
    InvalidName(String),
    #[error("raw sources `{0}` and `{1}` have overlapping dates")]
    OverlappingSources(String, String),
    #[error("dates not in any of the raw sources: {0:?}")]
    UncoveredDates(Vec<NaiveDate>),
    #[error("no raw sources found")]
    NoSources,
    #[error("unable to parse raw record `{0}`")]
    BadRecord(String),
    #[error("malformed topology entry `{0}`")]
    MalformedTopology(String),
    #[error("edge `{0}` appears more than once in the topology")]
    DuplicateEdge(String),
    #[error("edge `{edge}` references station {station}, which has no aggregated table")]
    MissingStation { edge: String, station: StationId },
    #[error("table `{key}` does not match the requested resolution/range: {problem}")]
    TableMismatch { key: String, problem: String },
    #[error("the lock on the shared output artifact was poisoned")]
    WriterPoisoned,
    #[error("unfinished output {0:?} from an earlier run exists; inspect and remove it first")]
    StalePartial(PathBuf),
    #[error("an aggregation worker panicked")]
    WorkerPanicked,
    #[error("{} station(s) failed to aggregate: {:?}", .0.len(), .0)]
    StationsFailed(Vec<(StationId, String)>),
}

/// The direction of travel, as recorded by a station.
///
/// The codes are relative to the station: what "1" means geographically differs from station
/// to station, which is why a [topology edge](topology::Edge) names the code for each station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    One, // 1
    Two, // 2
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::One, Direction::Two];

    /// Create a Direction from its code.
    pub fn from_num(num: u8) -> Result<Self, FlowError> {
        match num {
            1 => Ok(Direction::One),
            2 => Ok(Direction::Two),
            other => Err(FlowError::BadDirection(other)),
        }
    }

    pub fn num(self) -> u8 {
        match self {
            Direction::One => 1,
            Direction::Two => 2,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.num())
    }
}

/// The seven vehicle categories that stations classify vehicles into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VehicleCategory {
    Car,                   // 1
    TruckWithoutTrailer,   // 2
    Bus,                   // 3
    SemiTrailerTruck,      // 4
    TruckWithFullTrailer,  // 5
    CarWithTrailer,        // 6
    CarWithCaravan,        // 7
}

impl VehicleCategory {
    pub const ALL: [VehicleCategory; 7] = [
        VehicleCategory::Car,
        VehicleCategory::TruckWithoutTrailer,
        VehicleCategory::Bus,
        VehicleCategory::SemiTrailerTruck,
        VehicleCategory::TruckWithFullTrailer,
        VehicleCategory::CarWithTrailer,
        VehicleCategory::CarWithCaravan,
    ];

    /// Create a VehicleCategory from its code.
    pub fn from_num(num: u8) -> Result<Self, FlowError> {
        match num {
            1 => Ok(VehicleCategory::Car),
            2 => Ok(VehicleCategory::TruckWithoutTrailer),
            3 => Ok(VehicleCategory::Bus),
            4 => Ok(VehicleCategory::SemiTrailerTruck),
            5 => Ok(VehicleCategory::TruckWithFullTrailer),
            6 => Ok(VehicleCategory::CarWithTrailer),
            7 => Ok(VehicleCategory::CarWithCaravan),
            other => Err(FlowError::BadVehicleCategory(other)),
        }
    }

    pub fn num(self) -> u8 {
        match self {
            VehicleCategory::Car => 1,
            VehicleCategory::TruckWithoutTrailer => 2,
            VehicleCategory::Bus => 3,
            VehicleCategory::SemiTrailerTruck => 4,
            VehicleCategory::TruckWithFullTrailer => 5,
            VehicleCategory::CarWithTrailer => 6,
            VehicleCategory::CarWithCaravan => 7,
        }
    }
}

/// A single vehicle recorded by a station, prior to any binning.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub station: StationId,
    pub timestamp: NaiveDateTime,
    pub direction: Direction,
    pub category: VehicleCategory,
    /// False if the station flagged the reading as faulty.
    pub valid: bool,
}

/// The width of the windows that events are binned into.
///
/// Written as a sum of terms like `1w`, `2d`, `3h`, `15m` or `30s`, e.g. "1h30m".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution(TimeDelta);

impl Resolution {
    pub fn new(delta: TimeDelta) -> Result<Self, FlowError> {
        if delta <= TimeDelta::zero() || delta.subsec_nanos() != 0 {
            return Err(FlowError::InvalidResolution(format!("{delta}")));
        }
        Ok(Self(delta))
    }

    pub fn delta(&self) -> TimeDelta {
        self.0
    }
}

impl FromStr for Resolution {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FlowError::InvalidResolution(s.to_string());

        let mut seconds: i64 = 0;
        let mut digits = String::new();
        for c in s.trim().chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let unit = match c {
                'w' => 7 * 24 * 3600,
                'd' => 24 * 3600,
                'h' => 3600,
                'm' => 60,
                's' => 1,
                _ => return Err(invalid()),
            };
            let num: i64 = digits.parse().map_err(|_| invalid())?;
            seconds = num
                .checked_mul(unit)
                .and_then(|v| seconds.checked_add(v))
                .ok_or_else(invalid)?;
            digits.clear();
        }
        // Trailing number without a unit.
        if !digits.is_empty() {
            return Err(invalid());
        }
        let delta = TimeDelta::try_seconds(seconds).ok_or_else(invalid)?;
        Resolution::new(delta).map_err(|_| invalid())
    }
}

impl Display for Resolution {
    /// The shortest form, e.g. 90 minutes is "1h30m".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut remaining = self.0.num_seconds();
        for (unit, len) in [
            ('w', 7 * 24 * 3600),
            ('d', 24 * 3600),
            ('h', 3600),
            ('m', 60),
            ('s', 1),
        ] {
            if remaining >= len {
                write!(f, "{}{unit}", remaining / len)?;
                remaining %= len;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_bad_num_errs() {
        assert!(matches!(Direction::from_num(0), Err(FlowError::BadDirection(0))));
        assert!(matches!(Direction::from_num(3), Err(FlowError::BadDirection(3))));
    }

    #[test]
    fn vehicle_category_from_1_7_ok() {
        for i in 1..=7 {
            assert_eq!(VehicleCategory::from_num(i).unwrap().num(), i)
        }
        assert!(VehicleCategory::from_num(0).is_err());
        assert!(VehicleCategory::from_num(8).is_err());
    }

    #[test]
    fn resolution_parses_compound_terms() {
        let res: Resolution = "1h30m".parse().unwrap();
        assert_eq!(res.delta(), TimeDelta::try_minutes(90).unwrap());

        let res: Resolution = "1w2d".parse().unwrap();
        assert_eq!(res.delta(), TimeDelta::try_days(9).unwrap());

        let res: Resolution = "45s".parse().unwrap();
        assert_eq!(res.delta(), TimeDelta::try_seconds(45).unwrap());
    }

    #[test]
    fn resolution_rejects_bad_input() {
        assert!("".parse::<Resolution>().is_err());
        assert!("0h".parse::<Resolution>().is_err());
        assert!("15".parse::<Resolution>().is_err());
        assert!("1y".parse::<Resolution>().is_err());
        assert!("h".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_display_is_shortest_form() {
        let res: Resolution = "90m".parse().unwrap();
        assert_eq!(res.to_string(), "1h30m");
        let res: Resolution = "24h".parse().unwrap();
        assert_eq!(res.to_string(), "1d");
        let res: Resolution = "7d1s".parse().unwrap();
        assert_eq!(res.to_string(), "1w1s");
    }
}
