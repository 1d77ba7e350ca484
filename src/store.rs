//! Spatial store of the imported buildings and annotations, in a SQLite file.
//!
//! The store is a derived cache of the CityGML files and can always be rebuilt by
//! importing them again. It has a single writer; reads are not run concurrently with
//! writes. Every write call is one transaction.
//!
//! Annotation rows carry a copy of the bounding box and height of their owner, so that
//! they can be range queried, and placed, even if the owning building is not loaded.
use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use thiserror::Error;

use crate::geometry::estimate_normal;
use crate::model::{
    AnnotationContent, AnnotationKind, AnnotationProperties, Building, BuildingAnnotation,
    Surface, SurfaceAnnotation, SurfaceType, WorldCoordinateAnnotation,
};
use crate::parser::{ImportBatch, ParsedDataset};
use crate::spatial_structs::{BoundingBox, Point3};

pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
PRAGMA foreign_keys = OFF;
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS building (
    id TEXT PRIMARY KEY,
    measured_height REAL NOT NULL,
    min_x REAL, min_y REAL, min_z REAL,
    max_x REAL, max_y REAL, max_z REAL
);
CREATE INDEX IF NOT EXISTS building_bbox ON building (min_x, max_x, min_y, max_y);
CREATE TABLE IF NOT EXISTS surface (
    building_id TEXT NOT NULL REFERENCES building (id),
    id TEXT NOT NULL,
    surface_type TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (building_id, id)
);
CREATE INDEX IF NOT EXISTS surface_building ON surface (building_id, ordinal);
CREATE TABLE IF NOT EXISTS surface_point (
    building_id TEXT NOT NULL,
    surface_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    x REAL NOT NULL, y REAL NOT NULL, z REAL NOT NULL,
    PRIMARY KEY (building_id, surface_id, seq),
    FOREIGN KEY (building_id, surface_id) REFERENCES surface (building_id, id)
);
CREATE TABLE IF NOT EXISTS annotation (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    scale_with_viewer_distance INTEGER NOT NULL,
    scale_on_selection INTEGER NOT NULL,
    pointing_x REAL NOT NULL, pointing_y REAL NOT NULL, pointing_z REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS text_content (
    annotation_id TEXT PRIMARY KEY REFERENCES annotation (id),
    text TEXT NOT NULL,
    size REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS building_annotation (
    annotation_id TEXT PRIMARY KEY REFERENCES annotation (id),
    building_id TEXT NOT NULL REFERENCES building (id),
    measured_height REAL,
    min_x REAL, min_y REAL, min_z REAL,
    max_x REAL, max_y REAL, max_z REAL
);
CREATE TABLE IF NOT EXISTS surface_annotation (
    annotation_id TEXT PRIMARY KEY REFERENCES annotation (id),
    building_id TEXT NOT NULL REFERENCES building (id),
    surface_id TEXT NOT NULL,
    anchor_index INTEGER NOT NULL,
    relative_position REAL NOT NULL CHECK (relative_position BETWEEN 0 AND 1),
    height_above_base_line REAL NOT NULL,
    base_start_x REAL, base_start_y REAL, base_start_z REAL,
    base_end_x REAL, base_end_y REAL, base_end_z REAL,
    normal_x REAL, normal_y REAL, normal_z REAL,
    measured_height REAL,
    min_x REAL, min_y REAL, min_z REAL,
    max_x REAL, max_y REAL, max_z REAL,
    FOREIGN KEY (building_id, surface_id) REFERENCES surface (building_id, id)
);
CREATE TABLE IF NOT EXISTS world_annotation (
    annotation_id TEXT PRIMARY KEY REFERENCES annotation (id),
    x REAL NOT NULL, y REAL NOT NULL, z REAL NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Cannot query the store with an empty range")]
    EmptyRange,
    #[error("The store has schema version {found}, expected {expected}. Remove it and import the data again")]
    SchemaVersion { found: String, expected: i64 },
}

/// The owner of an annotation, as it is known at query time.
#[derive(Debug, Clone, PartialEq)]
pub enum Owner<'a> {
    Building(&'a Building),
    /// The owner is not in the store (or not among the loaded buildings), only the copy
    /// in the annotation row is available.
    Placeholder(PlaceholderOwner),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderOwner {
    pub building_id: String,
    pub measured_height: Option<f64>,
    pub bbox: BoundingBox,
    /// Base edge and normal of the owning surface, surface annotations only.
    pub base_edge: Option<(Point3, Point3)>,
    pub normal: Option<Point3>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord<'a, T> {
    pub annotation: T,
    pub owner: Owner<'a>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub buildings: usize,
    pub surfaces: usize,
    pub surface_points: usize,
    pub building_annotations: usize,
    pub surface_annotations: usize,
    pub world_annotations: usize,
}

pub struct SpatialStore {
    conn: Connection,
}

impl SpatialStore {
    /// Open (or create) the store at `path` and make sure that its schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        debug!("Opening the store {:?}", path.as_ref());
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create the tables if they do not exist. Fails on a store that was written with a
    /// different schema version.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        let found: String = self.conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        if found != SCHEMA_VERSION.to_string() {
            return Err(StoreError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// The schema is present and the store holds at least one building or annotation.
    pub fn is_initialized(&self) -> Result<bool, StoreError> {
        let has_data: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 WHERE EXISTS (SELECT 1 FROM building) OR EXISTS (SELECT 1 FROM annotation)",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(has_data.is_some())
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let count = |table: &str| -> Result<usize, StoreError> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n.max(0) as usize)
        };
        Ok(StoreCounts {
            buildings: count("building")?,
            surfaces: count("surface")?,
            surface_points: count("surface_point")?,
            building_annotations: count("building_annotation")?,
            surface_annotations: count("surface_annotation")?,
            world_annotations: count("world_annotation")?,
        })
    }

    /// Write every dataset of the batch in a single transaction.
    pub fn import(&mut self, batch: &ImportBatch) -> Result<StoreCounts, StoreError> {
        let tx = self.conn.transaction()?;
        for dataset in &batch.datasets {
            write_dataset(&tx, dataset)?;
        }
        tx.commit()?;
        let counts = self.counts()?;
        info!(
            "The store holds {} buildings, {} surfaces and {} annotations",
            counts.buildings,
            counts.surfaces,
            counts.building_annotations + counts.surface_annotations + counts.world_annotations
        );
        Ok(counts)
    }

    /// Insert or replace buildings. A replaced building loses its previous surfaces.
    pub fn upsert_buildings(&mut self, buildings: &[Building]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        write_buildings(&tx, buildings)?;
        tx.commit()?;
        Ok(())
    }

    /// `owners` provides the bounding box and height that are copied into the
    /// annotation rows.
    pub fn upsert_building_annotations(
        &mut self,
        annotations: &[BuildingAnnotation],
        owners: &[Building],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        write_building_annotations(&tx, annotations, &index_buildings(owners))?;
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_surface_annotations(
        &mut self,
        annotations: &[SurfaceAnnotation],
        owners: &[Building],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        write_surface_annotations(&tx, annotations, &index_buildings(owners))?;
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_world_annotations(
        &mut self,
        annotations: &[WorldCoordinateAnnotation],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        write_world_annotations(&tx, annotations)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a building with its surfaces. Its annotations are kept and resolve to a
    /// placeholder owner afterwards. Returns `false` if there was no such building.
    pub fn remove_building(&mut self, id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        delete_surfaces(&tx, id)?;
        let removed = tx.execute("DELETE FROM building WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Buildings whose bounding box intersects `range`, with their surfaces in import
    /// order.
    pub fn query_buildings(&self, range: &BoundingBox) -> Result<Vec<Building>, StoreError> {
        let bounds = range_params(range)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, measured_height FROM building
             WHERE min_x <= ?1 AND max_x >= ?2 AND min_y <= ?3 AND max_y >= ?4
               AND min_z <= ?5 AND max_z >= ?6
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params_from(&bounds), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut buildings = Vec::new();
        for row in rows {
            let (id, measured_height) = row?;
            let mut building = Building::new(id, measured_height);
            self.load_surfaces(&mut building)?;
            buildings.push(building);
        }
        debug!("{} buildings within {}", buildings.len(), range);
        Ok(buildings)
    }

    fn load_surfaces(&self, building: &mut Building) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT s.id, s.surface_type, p.x, p.y, p.z
             FROM surface s
             LEFT JOIN surface_point p ON p.building_id = s.building_id AND p.surface_id = s.id
             WHERE s.building_id = ?1
             ORDER BY s.ordinal, p.seq",
        )?;
        let rows = stmt.query_map(params![building.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                optional_point(row, 2)?,
            ))
        })?;
        let mut current: Option<Surface> = None;
        for row in rows {
            let (id, surface_type, point) = row?;
            if current.as_ref().map(|s| s.id != id).unwrap_or(true) {
                if let Some(done) = current.take() {
                    building.add_surface(done);
                }
                let surface_type: SurfaceType = surface_type.parse().unwrap_or_default();
                current = Some(Surface::new(id, surface_type));
            }
            if let (Some(surface), Some(point)) = (current.as_mut(), point) {
                surface.points.push(point);
            }
        }
        if let Some(done) = current {
            building.add_surface(done);
        }
        Ok(())
    }

    /// Building annotations whose owner intersects `range`. Owners are looked up in
    /// `buildings` (eg. the result of [`SpatialStore::query_buildings`]).
    pub fn query_building_annotations<'a>(
        &self,
        range: &BoundingBox,
        buildings: &'a HashMap<String, Building>,
    ) -> Result<Vec<AnnotationRecord<'a, BuildingAnnotation>>, StoreError> {
        let bounds = range_params(range)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.id, a.scale_with_viewer_distance, a.scale_on_selection,
                    a.pointing_x, a.pointing_y, a.pointing_z, t.text, t.size,
                    o.building_id, o.measured_height,
                    o.min_x, o.min_y, o.min_z, o.max_x, o.max_y, o.max_z
             FROM building_annotation o
             JOIN annotation a ON a.id = o.annotation_id
             JOIN text_content t ON t.annotation_id = a.id
             WHERE o.min_x <= ?1 AND o.max_x >= ?2 AND o.min_y <= ?3 AND o.max_y >= ?4
               AND o.min_z <= ?5 AND o.max_z >= ?6
             ORDER BY o.rowid",
        )?;
        let rows = stmt.query_map(params_from(&bounds), |row| {
            let building_id: String = row.get(8)?;
            let annotation = BuildingAnnotation {
                id: row.get(0)?,
                building_id: building_id.clone(),
                properties: read_properties(row, 1)?,
                content: read_text_content(row, 6)?,
            };
            let placeholder = PlaceholderOwner {
                building_id,
                measured_height: row.get(9)?,
                bbox: read_bbox(row, 10)?,
                base_edge: None,
                normal: None,
            };
            Ok((annotation, placeholder))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (annotation, placeholder) = row?;
            let owner = match buildings.get(&annotation.building_id) {
                Some(building) => Owner::Building(building),
                None => {
                    warn!(
                        "Building {} of annotation {} is not in the store, using a placeholder",
                        &annotation.building_id, &annotation.id
                    );
                    Owner::Placeholder(placeholder)
                }
            };
            records.push(AnnotationRecord { annotation, owner });
        }
        Ok(records)
    }

    /// Surface annotations whose owning building intersects `range`.
    pub fn query_surface_annotations<'a>(
        &self,
        range: &BoundingBox,
        buildings: &'a HashMap<String, Building>,
    ) -> Result<Vec<AnnotationRecord<'a, SurfaceAnnotation>>, StoreError> {
        let bounds = range_params(range)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.id, a.scale_with_viewer_distance, a.scale_on_selection,
                    a.pointing_x, a.pointing_y, a.pointing_z, t.text, t.size,
                    o.building_id, o.surface_id, o.anchor_index, o.relative_position,
                    o.height_above_base_line,
                    o.base_start_x, o.base_start_y, o.base_start_z,
                    o.base_end_x, o.base_end_y, o.base_end_z,
                    o.normal_x, o.normal_y, o.normal_z,
                    o.measured_height,
                    o.min_x, o.min_y, o.min_z, o.max_x, o.max_y, o.max_z
             FROM surface_annotation o
             JOIN annotation a ON a.id = o.annotation_id
             JOIN text_content t ON t.annotation_id = a.id
             WHERE o.min_x <= ?1 AND o.max_x >= ?2 AND o.min_y <= ?3 AND o.max_y >= ?4
               AND o.min_z <= ?5 AND o.max_z >= ?6
             ORDER BY o.rowid",
        )?;
        let rows = stmt.query_map(params_from(&bounds), |row| {
            let building_id: String = row.get(8)?;
            let anchor_index: i64 = row.get(10)?;
            let annotation = SurfaceAnnotation {
                id: row.get(0)?,
                building_id: building_id.clone(),
                surface_id: row.get(9)?,
                anchor_index: anchor_index.max(0) as usize,
                relative_position: row.get(11)?,
                height_above_base_line: row.get(12)?,
                properties: read_properties(row, 1)?,
                content: read_text_content(row, 6)?,
            };
            let base_edge = match (optional_point(row, 13)?, optional_point(row, 16)?) {
                (Some(start), Some(end)) => Some((start, end)),
                _ => None,
            };
            let placeholder = PlaceholderOwner {
                building_id,
                measured_height: row.get(22)?,
                bbox: read_bbox(row, 23)?,
                base_edge,
                normal: optional_point(row, 19)?,
            };
            Ok((annotation, placeholder))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (annotation, placeholder) = row?;
            let owner = match buildings.get(&annotation.building_id) {
                Some(building) if building.surface(&annotation.surface_id).is_some() => {
                    Owner::Building(building)
                }
                _ => {
                    warn!(
                        "Surface {} of annotation {} is not in the store, using a placeholder",
                        &annotation.surface_id, &annotation.id
                    );
                    Owner::Placeholder(placeholder)
                }
            };
            records.push(AnnotationRecord { annotation, owner });
        }
        Ok(records)
    }

    /// World coordinate annotations positioned within `range`.
    pub fn query_world_annotations(
        &self,
        range: &BoundingBox,
    ) -> Result<Vec<WorldCoordinateAnnotation>, StoreError> {
        let bounds = range_params(range)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.id, a.scale_with_viewer_distance, a.scale_on_selection,
                    a.pointing_x, a.pointing_y, a.pointing_z, t.text, t.size,
                    w.x, w.y, w.z
             FROM world_annotation w
             JOIN annotation a ON a.id = w.annotation_id
             JOIN text_content t ON t.annotation_id = a.id
             WHERE w.x <= ?1 AND w.x >= ?2 AND w.y <= ?3 AND w.y >= ?4
               AND w.z <= ?5 AND w.z >= ?6
             ORDER BY w.rowid",
        )?;
        let rows = stmt.query_map(params_from(&bounds), |row| {
            Ok(WorldCoordinateAnnotation {
                id: row.get(0)?,
                properties: read_properties(row, 1)?,
                content: read_text_content(row, 6)?,
                position: [row.get(8)?, row.get(9)?, row.get(10)?],
            })
        })?;
        let annotations = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(annotations)
    }
}

/// Query parameters `[max_x, min_x, max_y, min_y, max_z, min_z]` for an intersection
/// test against a stored box.
fn range_params(range: &BoundingBox) -> Result<[f64; 6], StoreError> {
    match range {
        BoundingBox::Empty => Err(StoreError::EmptyRange),
        BoundingBox::Bounds { min, max } => {
            // an unbounded Z range is passed as the largest finite values
            let finite = |v: f64| v.clamp(f64::MIN, f64::MAX);
            Ok([
                finite(max[0]),
                finite(min[0]),
                finite(max[1]),
                finite(min[1]),
                finite(max[2]),
                finite(min[2]),
            ])
        }
    }
}

fn params_from(bounds: &[f64; 6]) -> [&f64; 6] {
    [
        &bounds[0], &bounds[1], &bounds[2], &bounds[3], &bounds[4], &bounds[5],
    ]
}

fn bbox_columns(bbox: &BoundingBox) -> [Option<f64>; 6] {
    match bbox {
        BoundingBox::Empty => [None; 6],
        BoundingBox::Bounds { min, max } => [
            Some(min[0]),
            Some(min[1]),
            Some(min[2]),
            Some(max[0]),
            Some(max[1]),
            Some(max[2]),
        ],
    }
}

fn point_columns(point: Option<Point3>) -> [Option<f64>; 3] {
    match point {
        Some(p) => [Some(p[0]), Some(p[1]), Some(p[2])],
        None => [None; 3],
    }
}

fn optional_point(row: &Row, first: usize) -> rusqlite::Result<Option<Point3>> {
    let x: Option<f64> = row.get(first)?;
    let y: Option<f64> = row.get(first + 1)?;
    let z: Option<f64> = row.get(first + 2)?;
    Ok(match (x, y, z) {
        (Some(x), Some(y), Some(z)) => Some([x, y, z]),
        _ => None,
    })
}

fn read_bbox(row: &Row, first: usize) -> rusqlite::Result<BoundingBox> {
    Ok(match (optional_point(row, first)?, optional_point(row, first + 3)?) {
        (Some(min), Some(max)) => BoundingBox::from_corners(&min, &max),
        _ => BoundingBox::Empty,
    })
}

fn read_properties(row: &Row, first: usize) -> rusqlite::Result<AnnotationProperties> {
    Ok(AnnotationProperties {
        scale_with_viewer_distance: row.get(first)?,
        scale_on_selection: row.get(first + 1)?,
        pointing_direction: [
            row.get(first + 2)?,
            row.get(first + 3)?,
            row.get(first + 4)?,
        ],
    })
}

fn read_text_content(row: &Row, first: usize) -> rusqlite::Result<AnnotationContent> {
    Ok(AnnotationContent::Text {
        text: row.get(first)?,
        size: row.get(first + 1)?,
    })
}

fn index_buildings(buildings: &[Building]) -> HashMap<&str, &Building> {
    buildings.iter().map(|b| (b.id.as_str(), b)).collect()
}

fn write_dataset(tx: &Transaction, dataset: &ParsedDataset) -> Result<(), StoreError> {
    debug!("Writing {} to the store", &dataset.name);
    let owners = index_buildings(&dataset.buildings);
    write_buildings(tx, &dataset.buildings)?;
    write_building_annotations(tx, &dataset.building_annotations, &owners)?;
    write_surface_annotations(tx, &dataset.surface_annotations, &owners)?;
    write_world_annotations(tx, &dataset.world_annotations)?;
    Ok(())
}

fn delete_surfaces(tx: &Transaction, building_id: &str) -> Result<(), StoreError> {
    tx.prepare_cached("DELETE FROM surface_point WHERE building_id = ?1")?
        .execute(params![building_id])?;
    tx.prepare_cached("DELETE FROM surface WHERE building_id = ?1")?
        .execute(params![building_id])?;
    Ok(())
}

fn write_buildings(tx: &Transaction, buildings: &[Building]) -> Result<(), StoreError> {
    for building in buildings {
        let b = bbox_columns(&building.bbox());
        tx.prepare_cached(
            "INSERT OR REPLACE INTO building
             (id, measured_height, min_x, min_y, min_z, max_x, max_y, max_z)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            building.id,
            building.measured_height,
            b[0],
            b[1],
            b[2],
            b[3],
            b[4],
            b[5]
        ])?;
        delete_surfaces(tx, &building.id)?;
        let mut insert_surface = tx.prepare_cached(
            "INSERT OR REPLACE INTO surface (building_id, id, surface_type, ordinal)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut insert_point = tx.prepare_cached(
            "INSERT OR REPLACE INTO surface_point (building_id, surface_id, seq, x, y, z)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for (ordinal, surface) in building.surfaces().iter().enumerate() {
            insert_surface.execute(params![
                building.id,
                surface.id,
                surface.surface_type.as_str(),
                ordinal as i64
            ])?;
            for (seq, p) in surface.points.iter().enumerate() {
                insert_point.execute(params![
                    building.id,
                    surface.id,
                    seq as i64,
                    p[0],
                    p[1],
                    p[2]
                ])?;
            }
        }
    }
    debug!("Wrote {} buildings", buildings.len());
    Ok(())
}

fn write_annotation(
    tx: &Transaction,
    id: &str,
    kind: AnnotationKind,
    properties: &AnnotationProperties,
    content: &AnnotationContent,
) -> Result<(), StoreError> {
    let d = properties.pointing_direction;
    tx.prepare_cached(
        "INSERT OR REPLACE INTO annotation
         (id, kind, scale_with_viewer_distance, scale_on_selection, pointing_x, pointing_y, pointing_z)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        id,
        kind.as_str(),
        properties.scale_with_viewer_distance,
        properties.scale_on_selection,
        d[0],
        d[1],
        d[2]
    ])?;
    match content {
        AnnotationContent::Text { text, size } => {
            tx.prepare_cached(
                "INSERT OR REPLACE INTO text_content (annotation_id, text, size) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![id, text, size])?;
        }
    }
    Ok(())
}

fn write_building_annotations(
    tx: &Transaction,
    annotations: &[BuildingAnnotation],
    owners: &HashMap<&str, &Building>,
) -> Result<(), StoreError> {
    for annotation in annotations {
        write_annotation(
            tx,
            &annotation.id,
            AnnotationKind::Building,
            &annotation.properties,
            &annotation.content,
        )?;
        let owner = owners.get(annotation.building_id.as_str());
        if owner.is_none() {
            warn!(
                "Building {} of annotation {} is not part of the import",
                &annotation.building_id, &annotation.id
            );
        }
        let b = bbox_columns(&owner.map(|o| o.bbox()).unwrap_or_default());
        tx.prepare_cached(
            "INSERT OR REPLACE INTO building_annotation
             (annotation_id, building_id, measured_height, min_x, min_y, min_z, max_x, max_y, max_z)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(params![
            annotation.id,
            annotation.building_id,
            owner.map(|o| o.measured_height),
            b[0],
            b[1],
            b[2],
            b[3],
            b[4],
            b[5]
        ])?;
    }
    Ok(())
}

fn write_surface_annotations(
    tx: &Transaction,
    annotations: &[SurfaceAnnotation],
    owners: &HashMap<&str, &Building>,
) -> Result<(), StoreError> {
    for annotation in annotations {
        write_annotation(
            tx,
            &annotation.id,
            AnnotationKind::Surface,
            &annotation.properties,
            &annotation.content,
        )?;
        let owner = owners.get(annotation.building_id.as_str());
        let surface = owner.and_then(|o| o.surface(&annotation.surface_id));
        if surface.is_none() {
            warn!(
                "Surface {} of annotation {} is not part of the import",
                &annotation.surface_id, &annotation.id
            );
        }
        let edge = surface.and_then(|s| s.edge(annotation.anchor_index));
        let start = point_columns(edge.map(|e| e.0));
        let end = point_columns(edge.map(|e| e.1));
        let normal = point_columns(surface.and_then(|s| estimate_normal(&s.points).ok()));
        let b = bbox_columns(&owner.map(|o| o.bbox()).unwrap_or_default());
        tx.prepare_cached(
            "INSERT OR REPLACE INTO surface_annotation
             (annotation_id, building_id, surface_id, anchor_index, relative_position,
              height_above_base_line,
              base_start_x, base_start_y, base_start_z, base_end_x, base_end_y, base_end_z,
              normal_x, normal_y, normal_z, measured_height,
              min_x, min_y, min_z, max_x, max_y, max_z)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22)",
        )?
        .execute(params![
            annotation.id,
            annotation.building_id,
            annotation.surface_id,
            annotation.anchor_index as i64,
            annotation.relative_position,
            annotation.height_above_base_line,
            start[0],
            start[1],
            start[2],
            end[0],
            end[1],
            end[2],
            normal[0],
            normal[1],
            normal[2],
            owner.map(|o| o.measured_height),
            b[0],
            b[1],
            b[2],
            b[3],
            b[4],
            b[5]
        ])?;
    }
    Ok(())
}

fn write_world_annotations(
    tx: &Transaction,
    annotations: &[WorldCoordinateAnnotation],
) -> Result<(), StoreError> {
    for annotation in annotations {
        write_annotation(
            tx,
            &annotation.id,
            AnnotationKind::World,
            &annotation.properties,
            &annotation.content,
        )?;
        let p = annotation.position;
        tx.prepare_cached(
            "INSERT OR REPLACE INTO world_annotation (annotation_id, x, y, z) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![annotation.id, p[0], p[1], p[2]])?;
    }
    Ok(())
}
