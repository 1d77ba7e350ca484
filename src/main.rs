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
use std::io::stdout;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, error, info, warn};
use walkdir::WalkDir;

use gmlanchor::cli::{Cli, Command};
use gmlanchor::config::Config;
use gmlanchor::formats::scene_json::SceneDocument;
use gmlanchor::parser::parse_files;
use gmlanchor::scene::{Scene, SceneBuilder, TargetDetector};
use gmlanchor::spatial_structs::Point3;
use gmlanchor::store::SpatialStore;

static EXTENSIONS: [&str; 2] = ["gml", "xml"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Import {
            input,
            database,
            force,
        } => import(&input, &database, force),
        Command::Query {
            database,
            target,
            marker,
            config,
            range,
            output,
        } => {
            let mut config = match &config {
                Some(path) => {
                    let mut c = Config::from_file(path)?;
                    // A relative database path is relative to the configuration file.
                    if let (Some(db), Some(dir)) = (c.database.as_ref(), path.parent()) {
                        if db.is_relative() {
                            c.database = Some(dir.join(db));
                        }
                    }
                    c
                }
                None => Config::default(),
            };
            if let Some(range) = range {
                config.range = range;
            }
            let database = database
                .or_else(|| config.database.clone())
                .ok_or("The store is not set, use --database or set it in the configuration")?;
            query(&database, &config, target, marker.as_deref(), output.as_deref())
        }
    }
}

/// Return the CityGML files of the inputs. Directories are searched recursively.
fn find_citygml_files(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for input in inputs {
        for res in WalkDir::new(input).sort_by_file_name() {
            match res {
                Ok(entry) => {
                    let is_citygml = entry.file_type().is_file()
                        && entry
                            .path()
                            .extension()
                            .and_then(|ext| ext.to_str())
                            .map(|ext| EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                            .unwrap_or(false);
                    if is_citygml {
                        files.push(entry.path().to_path_buf());
                    }
                }
                Err(e) => warn!("Cannot access {:?}: {}", e.path(), e),
            }
        }
    }
    files
}

fn import(inputs: &[PathBuf], database: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = SpatialStore::open(database)?;
    if store.is_initialized()? && !force {
        info!(
            "The store {:?} already contains data, skipping the import. Use --force to import anyway.",
            database
        );
        return Ok(());
    }

    let files = find_citygml_files(inputs);
    info!("Found {} CityGML files", files.len());
    if files.is_empty() {
        return Err("No CityGML files (.gml, .xml) found in the input".into());
    }
    let batch = parse_files(&files);
    info!(
        "Parsed {} buildings and {} annotations from {} files",
        batch.building_count(),
        batch.annotation_count(),
        batch.datasets.len()
    );
    for (path, e) in &batch.failures {
        error!("Skipped {:?}: {}", path, e);
    }
    if batch.datasets.is_empty() {
        return Err("None of the CityGML files could be read".into());
    }

    let counts = store.import(&batch)?;
    debug!("{:?}", counts);
    info!("Done");
    Ok(())
}

fn query(
    database: &Path,
    config: &Config,
    target: Option<Point3>,
    marker: Option<&str>,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !database.exists() {
        return Err(format!("The store {:?} does not exist", database).into());
    }
    let store = SpatialStore::open(database)?;
    if !store.is_initialized()? {
        warn!("The store {:?} is empty, import CityGML files first", database);
    }

    let scene: Scene = match (target, marker) {
        (Some(target), _) => SceneBuilder::from_config(&store, config).build(target)?,
        (None, Some(marker)) => TargetDetector::from_config(&store, config)
            .on_target_detected(marker)?
            .ok_or("The marker did not produce a scene")?,
        (None, None) => return Err("Set either --target or --marker".into()),
    };

    let document = SceneDocument::from(&scene);
    match output {
        Some(path) => {
            document.to_file(path)?;
            info!("Wrote the scene to {:?}", path);
        }
        None => document.to_writer(stdout().lock())?,
    }
    Ok(())
}
