//! Marker targets and the tunable constants of the scene, read from a JSON file.
//!
//! ```json
//! {
//!   "database": "buildings.sqlite",
//!   "range": 300.0,
//!   "targets": { "entrance": [33310550.6, 5995765.9, 30.5] }
//! }
//! ```
//! Every field is optional.
use std::collections::BTreeMap;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::from_str;
use thiserror::Error;

use crate::scene::{DEFAULT_RANGE, ROOF_OFFSET, SURFACE_OFFSET};
use crate::spatial_structs::Point3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read the configuration {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("The range must be a positive number, found {0}")]
    InvalidRange(f64),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub range: f64,
    pub roof_offset: f64,
    pub surface_offset: f64,
    /// Real-world coordinates of the marker targets, by name.
    pub targets: BTreeMap<String, Point3>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            range: DEFAULT_RANGE,
            roof_offset: ROOF_OFFSET,
            surface_offset: SURFACE_OFFSET,
            targets: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str = read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_json(&config_str)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = from_str(json)?;
        if config.range <= 0.0 {
            return Err(ConfigError::InvalidRange(config.range));
        }
        Ok(config)
    }

    pub fn target(&self, name: &str) -> Option<Point3> {
        self.targets.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_data_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("resources")
            .join("data")
    }

    #[test]
    fn test_from_file() {
        let config = Config::from_file(test_data_dir().join("config.json")).unwrap();
        assert_eq!(config.database, Some(PathBuf::from("buildings.sqlite")));
        assert_eq!(config.range, 150.0);
        assert_eq!(config.roof_offset, ROOF_OFFSET);
        assert_eq!(config.target("entrance"), Some([1000.0, 2000.0, 0.0]));
        assert_eq!(config.target("missing"), None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.range, DEFAULT_RANGE);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            Config::from_json(r#"{"rnage": 10}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"targets": {"a": [1, 2]}}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"range": -5}"#),
            Err(ConfigError::InvalidRange(_))
        ));
        assert!(matches!(
            Config::from_file(test_data_dir().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
