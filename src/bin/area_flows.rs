//! Merge the station tables of an artifact into flows between areas.
//!
//! Usage: `area_flows <artifact-path>`
//!
//! The areas are those of `AREA_LEVEL`, and the topology relating them to stations is read from
//! `REFERENCE_DIR`. The flows are written to `FLOW_DIR`, in a file named after the area level and
//! the artifact's resolution and range. With `VISUALIZE=true`, a Graphviz rendering of the
//! topology is written alongside.
use std::env;
use std::fs::{self, OpenOptions};
use std::path::Path;

use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};

use traffic_flows::{
    config::Config,
    merge::merge,
    store::{write_flow_tables, ArtifactStore},
    topology::Topology,
    window::WindowGrid,
};

const LOG: &str = "area_flows.log";

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
    if args.len() < 2 {
        error!("Path of station artifact not supplied - aborting.");
        return;
    }

    let store = match ArtifactStore::open(Path::new(&args[1])) {
        Ok(v) => v,
        Err(e) => {
            error!("Unable to load {}: {e}", args[1]);
            return;
        }
    };
    let level = config.area_level;
    let topology = match level.load_topology(&config.reference_dir) {
        Ok(v) => v,
        Err(e) => {
            error!("Unable to load {level} topology: {e}");
            return;
        }
    };
    let grid = match WindowGrid::new(
        store.name.begin,
        store.name.end,
        store.name.resolution,
        config.tail,
    ) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let flows = match merge(&topology, &store, &grid) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    if let Err(e) = fs::create_dir_all(&config.flow_dir) {
        error!("Unable to create {:?}: {e}", config.flow_dir);
        return;
    }
    let path = config.flow_dir.join(store.name.flow_file_name(level));
    match write_flow_tables(&path, &flows) {
        Ok(()) => info!("Wrote flows along {} edges to {path:?}.", flows.len()),
        Err(e) => {
            error!("Unable to write {path:?}: {e}");
            return;
        }
    }

    if config.visualize {
        visualize(&config, &topology);
    }
}

/// Write the topology as a Graphviz digraph.
fn visualize(config: &Config, topology: &Topology) {
    let level = config.area_level;
    let coordinates = match level.load_coordinates(&config.reference_dir) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unable to load {level} coordinates, areas will be placed freely: {e}");
            Default::default()
        }
    };
    let path = config.flow_dir.join(format!("{level}_topology.dot"));
    match fs::write(&path, topology.to_dot(&coordinates)) {
        Ok(()) => info!("Wrote topology to {path:?}."),
        Err(e) => error!("Unable to write {path:?}: {e}"),
    }
}
