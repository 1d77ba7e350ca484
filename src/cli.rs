// Copyright 2023 Balázs Dukai, Ravi Peters
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use std::path::{Path, PathBuf};

use clap::{ArgGroup, Parser, Subcommand};

use crate::spatial_structs::Point3;

#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import CityGML files into the store.
    Import {
        /// CityGML file (.gml, .xml), or a directory. Directories and all their
        /// subdirectories are searched recursively for CityGML files.
        /// You can specify it multiple times.
        #[arg(short, long, required = true, value_parser = existing_canonical_path)]
        input: Vec<PathBuf>,
        /// The SQLite file of the store. It is created if it does not exist.
        #[arg(short, long)]
        database: PathBuf,
        /// Import even if the store already contains data. Buildings and annotations
        /// with the same id are replaced.
        #[arg(long)]
        force: bool,
    },
    /// Write the buildings and annotations around a target as JSON.
    #[command(group(ArgGroup::new("origin").required(true).args(["target", "marker"])))]
    Query {
        /// The SQLite file of the store. Defaults to the `database` of the
        /// configuration.
        #[arg(short, long, value_parser = existing_path)]
        database: Option<PathBuf>,
        /// Real-world coordinate of the target, as "x y z" in the coordinate reference
        /// system of the data.
        #[arg(short, long, value_parser = coordinate)]
        target: Option<Point3>,
        /// Name of a marker target in the configuration.
        #[arg(short, long, requires = "config")]
        marker: Option<String>,
        /// Configuration file (JSON) with the marker targets and the scene settings.
        #[arg(short, long, value_parser = existing_canonical_path)]
        config: Option<PathBuf>,
        /// Side length of the square range around the target. In input units (eg. meters).
        /// Overrides the range of the configuration.
        #[arg(short, long, value_parser = positive_number)]
        range: Option<f64>,
        /// Output file. The scene is written to stdout if not set.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn existing_canonical_path(s: &str) -> Result<PathBuf, String> {
    if let Ok(c) = Path::new(s).canonicalize() {
        if c.exists() {
            Ok(c)
        } else {
            Err(format!("path {:?} does not exist", &c))
        }
    } else {
        Err(format!("could not resolve the path {:?}", s))
    }
}

/// The store is opened in place, also through a symlink.
fn existing_path(s: &str) -> Result<PathBuf, String> {
    let p = Path::new(s).to_path_buf();
    if p.exists() {
        Ok(p)
    } else {
        Err(format!("path {:?} does not exist", &p))
    }
}

fn coordinate(s: &str) -> Result<Point3, String> {
    crate::parser::parse_coordinates(s)
        .map_err(|_| String::from("Input must be three numbers separated by spaces, eg. '85000.5 446500 2.1'"))
}

fn positive_number(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(String::from("Input must be a positive number")),
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use clap::{CommandFactory, Parser};

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    /// Can we pass multiple inputs?
    #[test]
    fn verify_import() {
        let data = concat!(env!("CARGO_MANIFEST_DIR"), "/resources/data");
        let cli = Cli::try_parse_from([
            "gmlanchor",
            "import",
            "-i",
            data,
            "--input",
            env!("CARGO_MANIFEST_DIR"),
            "-d",
            "buildings.sqlite",
        ])
        .unwrap();
        match cli.command {
            Command::Import {
                input,
                database,
                force,
            } => {
                assert_eq!(input.len(), 2);
                assert_eq!(database.to_str(), Some("buildings.sqlite"));
                assert!(!force);
            }
            _ => panic!("expected the import command"),
        }
    }

    #[test]
    fn verify_query_target() {
        let cli = Cli::try_parse_from([
            "gmlanchor",
            "query",
            "--target",
            "1000 2000.5 3",
            "--range",
            "150",
        ])
        .unwrap();
        match cli.command {
            Command::Query { target, range, .. } => {
                assert_eq!(target, Some([1000.0, 2000.5, 3.0]));
                assert_eq!(range, Some(150.0));
            }
            _ => panic!("expected the query command"),
        }
    }

    #[test]
    fn verify_query_requires_an_origin() {
        assert!(Cli::try_parse_from(["gmlanchor", "query"]).is_err());
        assert!(Cli::try_parse_from(["gmlanchor", "query", "--target", "1 2"]).is_err());
        // a marker needs a configuration
        assert!(Cli::try_parse_from(["gmlanchor", "query", "--marker", "entrance"]).is_err());
        assert!(Cli::try_parse_from(["gmlanchor", "query", "--target", "1 2 3", "--range", "-1"]).is_err());
    }
}
