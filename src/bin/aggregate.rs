//! Aggregate the raw data of every station in the roster into counts per time window.
//!
//! Usage: `aggregate <begin-date> <end-date>`, with dates as YYYY-MM-DD and the end date
//! exclusive.
//!
//! The raw data chunks in `RAW_DIR` are checked first: no date may be in more than one chunk, and
//! there may be no gaps between them. Then, depending on what is already in `AGGREGATE_DIR`, a new
//! artifact is created, an existing one is extended up to the end date, or nothing is done because
//! the range has already been aggregated.
//!
//! See [`Config`] for the environment variables used. A [log][`LOG`] of the program's work is
//! kept in `LOG_DIR`.
use std::env;
use std::fs::{self, OpenOptions};

use chrono::{NaiveDate, NaiveTime};
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};

use traffic_flows::{
    config::Config,
    coordinator::RunOutcome,
    raw::{check_all_dates_covered, check_no_overlap, list_chunks, CsvEventSource},
    topology::read_station_roster,
};

const LOG: &str = "aggregate.log";

fn main() {
    // Load file containing environment variables, panic if it doesn't exist.
    dotenvy::dotenv().expect("Unable to load .env file.");

    // Get env var for path where log will be, panic if it doesn't exist.
    let log_dir = env::var("LOG_DIR").expect("Unable to load log directory path from .env file.");

    // Set up logging, panic if it fails.
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();
    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Debug,
            log_config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Info,
            log_config,
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(format!("{log_dir}/{LOG}"))
                .expect("Could not open log file."),
        ),
    ])
    .expect("Could not configure logging.");

    let config = match Config::from_env() {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        error!("Begin and end dates (YYYY-MM-DD) not supplied - aborting.");
        return;
    }
    let (begin, end) = match (
        NaiveDate::parse_from_str(&args[1], "%Y-%m-%d"),
        NaiveDate::parse_from_str(&args[2], "%Y-%m-%d"),
    ) {
        (Ok(begin), Ok(end)) => (begin.and_time(NaiveTime::MIN), end.and_time(NaiveTime::MIN)),
        (Err(e), _) | (_, Err(e)) => {
            error!("Unable to parse dates: {e}.");
            return;
        }
    };

    // Check the raw data before doing any work.
    let chunks = match list_chunks(&config.raw_dir) {
        Ok(v) => v,
        Err(e) => {
            error!("Unable to list raw data: {e}");
            return;
        }
    };
    if let Err(e) = check_no_overlap(&chunks).and_then(|_| check_all_dates_covered(&chunks)) {
        error!("{e}");
        return;
    }
    if !chunks
        .iter()
        .any(|chunk| chunk.begin_datetime() <= begin)
        || !chunks.iter().any(|chunk| end <= chunk.end_datetime())
    {
        warn!("Raw data doesn't cover all of [{begin}, {end}); missing dates will have counts of 0.");
    }

    let stations = match read_station_roster(&config.station_roster_path()) {
        Ok(v) => v,
        Err(e) => {
            error!("Unable to load station roster: {e}");
            return;
        }
    };
    info!("Aggregating {} stations over [{begin}, {end}).", stations.len());

    if let Err(e) = fs::create_dir_all(&config.aggregate_dir) {
        error!("Unable to create {:?}: {e}", config.aggregate_dir);
        return;
    }

    let source = CsvEventSource::new(&config.raw_dir);
    match config.coordinator().run(
        &source,
        &chunks,
        &stations,
        &config.aggregate_dir,
        begin,
        end,
        config.resolution,
    ) {
        Ok(RunOutcome::Completed(report)) => {
            for (station, reason) in &report.failed {
                warn!("Station {station} left out: {reason}");
            }
            info!(
                "Aggregated {} stations into {:?}.",
                report.aggregated, report.path
            );
        }
        Ok(RunOutcome::AlreadyCovered(_, path)) => {
            info!("Nothing to do; already aggregated in {path:?}.")
        }
        Err(e) => error!("{e}"),
    }
}
