//! Configuration from environment variables (typically loaded from a `.env` file).
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{
    coordinator::{Coordinator, FailurePolicy},
    topology::AreaLevel,
    window::TailPolicy,
    FlowError, Resolution,
};

/// File with the ids of the stations to aggregate, in the reference directory.
pub const STATION_ROSTER: &str = "stations.csv";

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the raw data chunks are.
    pub raw_dir: PathBuf,
    /// Where station artifacts are kept.
    pub aggregate_dir: PathBuf,
    /// Where area flows are written.
    pub flow_dir: PathBuf,
    /// Station roster, topologies and area coordinates.
    pub reference_dir: PathBuf,
    pub log_dir: PathBuf,
    pub resolution: Resolution,
    pub area_level: AreaLevel,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    pub tail: TailPolicy,
    /// Whether to also write a DOT rendering of the topology.
    pub visualize: bool,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, FlowError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the configuration using `lookup` to get variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FlowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required =
            |name: &str| lookup(name).ok_or_else(|| FlowError::MissingEnvVar(name.to_string()));

        let workers = match lookup("WORKERS") {
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(FlowError::InvalidConfig {
                        name: "WORKERS".to_string(),
                        value: v,
                    })
                }
            },
            None => Coordinator::default().workers,
        };

        Ok(Self {
            raw_dir: required("RAW_DIR")?.into(),
            aggregate_dir: required("AGGREGATE_DIR")?.into(),
            flow_dir: required("FLOW_DIR")?.into(),
            reference_dir: required("REFERENCE_DIR")?.into(),
            log_dir: required("LOG_DIR")?.into(),
            resolution: required("TIME_RESOLUTION")?.parse()?,
            area_level: optional(&lookup, "AREA_LEVEL")?,
            workers,
            failure_policy: optional(&lookup, "ON_STATION_FAILURE")?,
            tail: optional(&lookup, "TAIL_POLICY")?,
            visualize: matches!(lookup("VISUALIZE").as_deref(), Some("true")),
        })
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator {
            workers: self.workers,
            tail: self.tail,
            failure_policy: self.failure_policy,
        }
    }

    pub fn station_roster_path(&self) -> PathBuf {
        self.reference_dir.join(STATION_ROSTER)
    }
}

/// Parse an optional variable, falling back to the default if it isn't set.
fn optional<T, F>(lookup: &F, name: &str) -> Result<T, FlowError>
where
    T: FromStr<Err = FlowError> + Default,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(v) => v.parse(),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = [
            ("RAW_DIR", "/data/raw"),
            ("AGGREGATE_DIR", "/data/aggregated"),
            ("FLOW_DIR", "/data/flows"),
            ("REFERENCE_DIR", "/data/reference"),
            ("LOG_DIR", "/var/log/traffic"),
            ("TIME_RESOLUTION", "1h"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        vars
    }

    #[test]
    fn config_defaults_ok() {
        let vars = vars(&[]);
        let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.resolution, "1h".parse().unwrap());
        assert_eq!(config.area_level, AreaLevel::Hcd);
        assert_eq!(config.failure_policy, FailurePolicy::SkipAndWarn);
        assert_eq!(config.tail, TailPolicy::ShortFinal);
        assert!(config.workers > 0);
        assert!(!config.visualize);
        assert_eq!(
            config.station_roster_path(),
            PathBuf::from("/data/reference/stations.csv")
        );
    }

    #[test]
    fn config_optional_values_ok() {
        let vars = vars(&[
            ("AREA_LEVEL", "erva"),
            ("WORKERS", "3"),
            ("ON_STATION_FAILURE", "abort"),
            ("TAIL_POLICY", "full"),
            ("VISUALIZE", "true"),
        ]);
        let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.area_level, AreaLevel::Erva);
        assert_eq!(config.workers, 3);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.tail, TailPolicy::FullOnly);
        assert!(config.visualize);
        assert_eq!(config.coordinator().workers, 3);
    }

    #[test]
    fn config_errs_if_missing_var() {
        let mut vars = vars(&[]);
        vars.remove("FLOW_DIR");
        assert!(matches!(
            Config::from_lookup(|name| vars.get(name).cloned()),
            Err(FlowError::MissingEnvVar(name)) if name == "FLOW_DIR"
        ));
    }

    #[test]
    fn config_errs_if_invalid_values() {
        for (name, value) in [
            ("WORKERS", "0"),
            ("WORKERS", "many"),
            ("AREA_LEVEL", "county"),
            ("TAIL_POLICY", "half"),
        ] {
            let vars = vars(&[(name, value)]);
            assert!(
                matches!(
                    Config::from_lookup(|name| vars.get(name).cloned()),
                    Err(FlowError::InvalidConfig { .. })
                ),
                "{name}={value}"
            );
        }
        let vars = vars(&[("TIME_RESOLUTION", "1 hour")]);
        assert!(matches!(
            Config::from_lookup(|name| vars.get(name).cloned()),
            Err(FlowError::InvalidResolution(_))
        ));
    }
}
