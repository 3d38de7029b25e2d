//! Raw per-vehicle records and the dated chunks they are stored in.
//!
//! Raw data is fetched (elsewhere) into chunks, each covering a range of dates and named
//! `fin_traffic_raw_<begin>_<end>`, with the end date exclusive. A chunk is a directory holding
//! one semicolon-delimited file per station, `tms_<id>.csv`, with the following fields:
//!
//! station id; year (2 digits); day number; hour; minute; second; millisecond; length; lane;
//! direction; vehicle category; speed; faulty; total time; timespan; queue begin
//!
//! The day number is the offset in days from the first of January of that year.
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use csv::{Reader, ReaderBuilder, StringRecord};
use log::{debug, warn};

use crate::{Direction, FlowError, RawEvent, StationId, VehicleCategory};

pub const CHUNK_PREFIX: &str = "fin_traffic_raw_";

/// A source of raw data covering the dates `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChunk {
    pub id: String,
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl SourceChunk {
    pub fn new(begin: NaiveDate, end: NaiveDate) -> Self {
        Self {
            id: format!("{CHUNK_PREFIX}{begin}_{end}"),
            begin,
            end,
        }
    }

    /// Get a chunk from its name, e.g. "fin_traffic_raw_2020-01-01_2020-02-01".
    pub fn from_name(name: &str) -> Result<Self, FlowError> {
        let invalid = || FlowError::InvalidName(name.to_string());

        let dates = name.strip_prefix(CHUNK_PREFIX).ok_or_else(invalid)?;
        let (begin, end) = dates.split_once('_').ok_or_else(invalid)?;
        let begin = NaiveDate::parse_from_str(begin, "%Y-%m-%d").map_err(|_| invalid())?;
        let end = NaiveDate::parse_from_str(end, "%Y-%m-%d").map_err(|_| invalid())?;
        if begin >= end {
            return Err(invalid());
        }

        Ok(Self {
            id: name.to_string(),
            begin,
            end,
        })
    }

    pub fn begin_datetime(&self) -> NaiveDateTime {
        self.begin.and_time(chrono::NaiveTime::MIN)
    }

    pub fn end_datetime(&self) -> NaiveDateTime {
        self.end.and_time(chrono::NaiveTime::MIN)
    }

    /// Whether the instant falls within the dates this chunk covers.
    pub fn covers(&self, datetime: NaiveDateTime) -> bool {
        self.begin_datetime() <= datetime && datetime < self.end_datetime()
    }

    /// Whether any part of `[begin, end)` falls within this chunk.
    pub fn overlaps(&self, begin: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.begin_datetime() < end && begin < self.end_datetime()
    }
}

/// List the chunks in a directory, ordered by their first date.
///
/// Anything not starting with [`CHUNK_PREFIX`] is ignored; anything that does but isn't
/// otherwise a valid chunk name is an error.
pub fn list_chunks(dir: &Path) -> Result<Vec<SourceChunk>, FlowError> {
    let mut chunks = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(CHUNK_PREFIX) || !entry.path().is_dir() {
            continue;
        }
        chunks.push(SourceChunk::from_name(&name)?);
    }
    chunks.sort_by_key(|chunk| chunk.begin);
    Ok(chunks)
}

/// Ensure that no date is in more than one chunk.
pub fn check_no_overlap(chunks: &[SourceChunk]) -> Result<(), FlowError> {
    for (i, chunk) in chunks.iter().enumerate() {
        for other in &chunks[i + 1..] {
            if chunk.begin < other.end && other.begin < chunk.end {
                return Err(FlowError::OverlappingSources(
                    chunk.id.clone(),
                    other.id.clone(),
                ));
            }
        }
    }
    Ok(())
}

/// Ensure that every date from the earliest to the latest is in some chunk.
pub fn check_all_dates_covered(chunks: &[SourceChunk]) -> Result<(), FlowError> {
    let first = chunks
        .iter()
        .map(|chunk| chunk.begin)
        .min()
        .ok_or(FlowError::NoSources)?;
    let last = chunks
        .iter()
        .map(|chunk| chunk.end)
        .max()
        .ok_or(FlowError::NoSources)?;

    let uncovered = first
        .iter_days()
        .take_while(|date| *date < last)
        .filter(|date| {
            !chunks
                .iter()
                .any(|chunk| chunk.begin <= *date && *date < chunk.end)
        })
        .collect::<Vec<_>>();

    if uncovered.is_empty() {
        Ok(())
    } else {
        Err(FlowError::UncoveredDates(uncovered))
    }
}

/// The chunks with any coverage of `[begin, end)`, in order.
pub fn chunks_for_range(
    chunks: &[SourceChunk],
    begin: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<SourceChunk> {
    chunks
        .iter()
        .filter(|chunk| chunk.overlaps(begin, end))
        .cloned()
        .collect()
}

/// A reader of the raw events of one station in one chunk.
pub trait EventSource: Sync {
    /// Read all events of `station` in `chunk`.
    ///
    /// A station that isn't in the chunk has no events; that is not an error.
    fn read_events(
        &self,
        chunk: &SourceChunk,
        station: StationId,
    ) -> Result<Vec<RawEvent>, FlowError>;
}

/// Raw events stored as CSV files in chunk directories.
#[derive(Debug, Clone)]
pub struct CsvEventSource {
    dir: PathBuf,
}

impl CsvEventSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, chunk: &SourceChunk, station: StationId) -> PathBuf {
        self.dir.join(&chunk.id).join(format!("tms_{station}.csv"))
    }
}

impl EventSource for CsvEventSource {
    fn read_events(
        &self,
        chunk: &SourceChunk,
        station: StationId,
    ) -> Result<Vec<RawEvent>, FlowError> {
        let path = self.path(chunk, station);
        if !path.exists() {
            debug!("No data for station {station} in {}.", chunk.id);
            return Ok(vec![]);
        }
        let data_file = File::open(&path)?;
        let mut rdr = create_reader(&data_file);

        let mut events = vec![];
        for row in rdr.records() {
            let row = match row {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping unreadable row in {path:?}: {e}");
                    continue;
                }
            };
            match parse_event(&row) {
                Ok(v) => events.push(v),
                Err(e) => {
                    warn!("Skipping row in {path:?}: {e}");
                    continue;
                }
            }
        }
        Ok(events)
    }
}

/// Create CSV reader over the semicolon-delimited raw files.
pub fn create_reader(file: &File) -> Reader<&File> {
    ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b';')
        .flexible(true)
        .from_reader(file)
}

/// Parse one raw record.
pub fn parse_event(row: &StringRecord) -> Result<RawEvent, FlowError> {
    let bad = || FlowError::BadRecord(row.iter().collect::<Vec<_>>().join(";"));
    let field = |i: usize| -> Result<i64, FlowError> {
        row.get(i)
            .ok_or_else(bad)?
            .trim()
            .parse::<i64>()
            .map_err(|_| bad())
    };

    let station = StationId::try_from(field(0)?).map_err(|_| bad())?;
    let year = 2000 + i32::try_from(field(1)?).map_err(|_| bad())?;
    let start_of_year = NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(bad)?
        .and_time(chrono::NaiveTime::MIN);

    let offset = [
        TimeDelta::try_days(field(2)?),
        TimeDelta::try_hours(field(3)?),
        TimeDelta::try_minutes(field(4)?),
        TimeDelta::try_seconds(field(5)?),
        TimeDelta::try_milliseconds(field(6)?),
    ]
    .into_iter()
    .try_fold(TimeDelta::zero(), |acc, part| acc.checked_add(&part?))
    .ok_or_else(bad)?;
    let timestamp = start_of_year.checked_add_signed(offset).ok_or_else(bad)?;

    let direction = Direction::from_num(u8::try_from(field(9)?).map_err(|_| bad())?)?;
    let category = VehicleCategory::from_num(u8::try_from(field(10)?).map_err(|_| bad())?)?;
    let valid = field(12)? == 0;

    Ok(RawEvent {
        station,
        timestamp,
        direction,
        category,
        valid,
    })
}

/// Iterates over the events of one station across consecutive chunks.
///
/// Chunks are read lazily, one at a time. Events outside the dates covered by the chunk they
/// were read from are skipped, so that each window's events come from the one chunk covering it.
pub struct EventCursor<'a, S: EventSource + ?Sized> {
    source: &'a S,
    station: StationId,
    chunks: &'a [SourceChunk],
    next_chunk: usize,
    current: Option<&'a SourceChunk>,
    buffer: std::vec::IntoIter<RawEvent>,
}

impl<'a, S: EventSource + ?Sized> EventCursor<'a, S> {
    pub fn new(source: &'a S, station: StationId, chunks: &'a [SourceChunk]) -> Self {
        Self {
            source,
            station,
            chunks,
            next_chunk: 0,
            current: None,
            buffer: vec![].into_iter(),
        }
    }
}

impl<S: EventSource + ?Sized> Iterator for EventCursor<'_, S> {
    type Item = Result<RawEvent, FlowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.current {
                for event in self.buffer.by_ref() {
                    if chunk.covers(event.timestamp) {
                        return Some(Ok(event));
                    }
                }
            }

            let chunk = self.chunks.get(self.next_chunk)?;
            self.next_chunk += 1;
            match self.source.read_events(chunk, self.station) {
                Ok(events) => {
                    self.current = Some(chunk);
                    self.buffer = events.into_iter();
                }
                Err(e) => {
                    self.current = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
