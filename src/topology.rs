//! Reference data: the areas, which stations measure the traffic between them, and the
//! stations to aggregate.
//!
//! The topology is a directed graph of areas. Each edge `source -> destination` lists the
//! (station, direction) pairs whose vehicles travel from the source area into the destination
//! area. It is read from a CSV file with the fields `source`, `destination` and `tms`, the last
//! being a semicolon-separated list of `station,direction` pairs, e.g. "1234,1;1301,2".
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display, Write};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::{Direction, FlowError, StationId};

/// The kind of area that flows are aggregated between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AreaLevel {
    Province,
    /// University hospital catchment area.
    Erva,
    /// Hospital district.
    #[default]
    Hcd,
}

impl FromStr for AreaLevel {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "province" => Ok(AreaLevel::Province),
            "erva" => Ok(AreaLevel::Erva),
            "hcd" => Ok(AreaLevel::Hcd),
            _ => Err(FlowError::InvalidConfig {
                name: "AREA_LEVEL".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl Display for AreaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaLevel::Province => write!(f, "province"),
            AreaLevel::Erva => write!(f, "erva"),
            AreaLevel::Hcd => write!(f, "hcd"),
        }
    }
}

impl AreaLevel {
    pub fn topology_path(&self, reference_dir: &Path) -> PathBuf {
        reference_dir.join(format!("tms_over_{self}_borders.csv"))
    }

    pub fn coordinates_path(&self, reference_dir: &Path) -> PathBuf {
        reference_dir.join(format!("{self}_coordinates.csv"))
    }

    pub fn load_topology(&self, reference_dir: &Path) -> Result<Topology, FlowError> {
        Topology::from_path(&self.topology_path(reference_dir))
    }

    pub fn load_coordinates(
        &self,
        reference_dir: &Path,
    ) -> Result<HashMap<String, Coordinates>, FlowError> {
        read_coordinates(&self.coordinates_path(reference_dir))
    }
}

/// A station (and its direction) contributing to the flow along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contributor {
    pub station: StationId,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: String,
    pub destination: String,
    pub contributors: Vec<Contributor>,
}

impl Edge {
    /// The key flows along this edge are stored under, "source:destination".
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.destination)
    }
}

#[derive(Debug, Deserialize)]
struct TopologyRow {
    source: String,
    destination: String,
    tms: String,
}

/// Directed graph of areas.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    edges: Vec<Edge>,
    index: HashMap<(String, String), usize>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge. Each ordered pair of areas may only be added once.
    pub fn add_edge(
        &mut self,
        source: &str,
        destination: &str,
        contributors: Vec<Contributor>,
    ) -> Result<(), FlowError> {
        let pair = (source.to_string(), destination.to_string());
        if self.index.contains_key(&pair) {
            return Err(FlowError::DuplicateEdge(format!("{source}:{destination}")));
        }
        if contributors.is_empty() {
            return Err(FlowError::MalformedTopology(format!(
                "{source}:{destination} has no stations"
            )));
        }
        self.index.insert(pair, self.edges.len());
        self.edges.push(Edge {
            source: source.to_string(),
            destination: destination.to_string(),
            contributors,
        });
        Ok(())
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, FlowError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut topology = Self::new();
        for row in rdr.deserialize() {
            let row: TopologyRow = row?;
            let contributors = parse_contributors(&row.tms)?;
            topology.add_edge(row.source.trim(), row.destination.trim(), contributors)?;
        }
        Ok(topology)
    }

    pub fn from_path(path: &Path) -> Result<Self, FlowError> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// All edges, in the order they were added.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, source: &str, destination: &str) -> Option<&Edge> {
        self.index
            .get(&(source.to_string(), destination.to_string()))
            .map(|i| &self.edges[*i])
    }

    /// Edges leaving an area.
    pub fn outgoing<'a>(&'a self, area: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == area)
    }

    pub fn areas(&self) -> BTreeSet<&str> {
        self.edges
            .iter()
            .flat_map(|e| [e.source.as_str(), e.destination.as_str()])
            .collect()
    }

    /// Every station referenced by some edge.
    pub fn stations(&self) -> BTreeSet<StationId> {
        self.edges
            .iter()
            .flat_map(|e| e.contributors.iter().map(|c| c.station))
            .collect()
    }

    /// Render as a Graphviz digraph, placing areas with known coordinates.
    pub fn to_dot(&self, coordinates: &HashMap<String, Coordinates>) -> String {
        let mut dot = String::from("digraph areas {\n");
        for area in self.areas() {
            match coordinates.get(area) {
                Some(c) => {
                    let _ = writeln!(
                        dot,
                        "    \"{area}\" [pos=\"{},{}!\"];",
                        c.longitude, c.latitude
                    );
                }
                None => {
                    let _ = writeln!(dot, "    \"{area}\";");
                }
            }
        }
        for edge in &self.edges {
            let label = edge
                .contributors
                .iter()
                .map(|c| format!("{},{}", c.station, c.direction))
                .collect::<Vec<_>>()
                .join(";");
            let _ = writeln!(
                dot,
                "    \"{}\" -> \"{}\" [label=\"{label}\"];",
                edge.source, edge.destination
            );
        }
        dot.push_str("}\n");
        dot
    }
}

/// Parse "station,direction" pairs separated by semicolons.
pub fn parse_contributors(s: &str) -> Result<Vec<Contributor>, FlowError> {
    let malformed = || FlowError::MalformedTopology(s.to_string());

    let mut contributors = vec![];
    for pair in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (station, direction) = pair.split_once(',').ok_or_else(malformed)?;
        let station = station.trim().parse().map_err(|_| malformed())?;
        let direction: u8 = direction.trim().parse().map_err(|_| malformed())?;
        contributors.push(Contributor {
            station,
            direction: Direction::from_num(direction)?,
        });
    }
    Ok(contributors)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Deserialize)]
struct CoordinatesRow {
    area: String,
    longitude: f64,
    latitude: f64,
}

/// Read area coordinates from a CSV file with the fields `area`, `longitude` and `latitude`.
pub fn read_coordinates(path: &Path) -> Result<HashMap<String, Coordinates>, FlowError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut coordinates = HashMap::new();
    for row in rdr.deserialize() {
        let row: CoordinatesRow = row?;
        coordinates.insert(
            row.area,
            Coordinates {
                longitude: row.longitude,
                latitude: row.latitude,
            },
        );
    }
    Ok(coordinates)
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    id: StationId,
}

/// Read the stations to aggregate from a CSV file with an `id` field.
pub fn read_station_roster(path: &Path) -> Result<Vec<StationId>, FlowError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut stations = vec![];
    for row in rdr.deserialize() {
        let row: RosterRow = row?;
        stations.push(row.id);
    }
    Ok(stations)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = "source,destination,tms
A,B,\"3,1;7,1\"
B,A,\"3,2;7,2\"
B,C,\"12,1\"
";

    #[test]
    fn topology_from_reader_ok() {
        let topology = Topology::from_reader(TOPOLOGY.as_bytes()).unwrap();
        assert_eq!(topology.edges().len(), 3);

        let edge = topology.edge("A", "B").unwrap();
        assert_eq!(edge.key(), "A:B");
        assert_eq!(
            edge.contributors,
            vec![
                Contributor {
                    station: 3,
                    direction: Direction::One
                },
                Contributor {
                    station: 7,
                    direction: Direction::One
                },
            ]
        );
        assert!(topology.edge("C", "B").is_none());
        assert_eq!(topology.outgoing("B").count(), 2);
        assert_eq!(topology.areas().into_iter().collect::<Vec<_>>(), vec!["A", "B", "C"]);
        assert_eq!(
            topology.stations().into_iter().collect::<Vec<_>>(),
            vec![3, 7, 12]
        );
    }

    #[test]
    fn topology_errs_on_bad_direction() {
        let data = "source,destination,tms\nA,B,\"3,3\"\n";
        assert!(matches!(
            Topology::from_reader(data.as_bytes()),
            Err(FlowError::BadDirection(3))
        ));
    }

    #[test]
    fn topology_errs_on_malformed_stations() {
        for tms in ["3", "x,1", "3;1", ""] {
            let data = format!("source,destination,tms\nA,B,\"{tms}\"\n");
            assert!(
                matches!(
                    Topology::from_reader(data.as_bytes()),
                    Err(FlowError::MalformedTopology(_))
                ),
                "{tms}"
            );
        }
    }

    #[test]
    fn topology_errs_on_duplicate_edge() {
        let data = "source,destination,tms\nA,B,\"3,1\"\nA,B,\"7,1\"\n";
        assert!(matches!(
            Topology::from_reader(data.as_bytes()),
            Err(FlowError::DuplicateEdge(_))
        ));
    }

    #[test]
    fn area_level_paths() {
        let dir = Path::new("reference");
        assert_eq!(
            AreaLevel::Province.topology_path(dir),
            Path::new("reference/tms_over_province_borders.csv")
        );
        assert_eq!(
            AreaLevel::Erva.coordinates_path(dir),
            Path::new("reference/erva_coordinates.csv")
        );
        assert_eq!("hcd".parse::<AreaLevel>().unwrap(), AreaLevel::Hcd);
        assert!("county".parse::<AreaLevel>().is_err());
    }

    #[test]
    fn dot_places_areas_with_coordinates() {
        let topology = Topology::from_reader(TOPOLOGY.as_bytes()).unwrap();
        let coordinates = HashMap::from([(
            "A".to_string(),
            Coordinates {
                longitude: 24.5,
                latitude: 60.25,
            },
        )]);
        let dot = topology.to_dot(&coordinates);
        assert!(dot.starts_with("digraph areas {"));
        assert!(dot.contains("\"A\" [pos=\"24.5,60.25!\"];"));
        assert!(dot.contains("\"C\";"));
        assert!(dot.contains("\"A\" -> \"B\" [label=\"3,1;7,1\"];"));
    }
}
