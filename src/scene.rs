//! The buildings and annotations around a detected target, ready to be rendered.
//!
//! Everything in a [`Scene`] is in the viewer frame of the target: Y-up, single
//! precision, with the target at the origin.
use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::Config;
use crate::geometry::{estimate_normal, ground_surface, GeometryError, SurfaceMesh};
use crate::model::{
    Annotation, AnnotationContent, AnnotationKind, AnnotationProperties, Building,
    BuildingAnnotation, SurfaceAnnotation, SurfaceType,
};
use crate::spatial_structs::{BoundingBox, Point3};
use crate::store::{AnnotationRecord, Owner, SpatialStore, StoreError};
use crate::transform::{Frame, PrecisionError};

/// Side length of the square range around the target.
pub const DEFAULT_RANGE: f64 = 300.0;
/// Distance between the roof and a building annotation.
pub const ROOF_OFFSET: f64 = 1.0;
/// Distance between a surface and its annotations, along the surface normal.
pub const SURFACE_OFFSET: f64 = 0.01;

#[derive(Error, Debug)]
pub enum SceneError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("The range must be a positive number, found {0}")]
    InvalidRange(f64),
    #[error("Unknown target '{0}'")]
    UnknownTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Orientation {
    /// Billboard, always turned towards the viewer.
    FaceViewer,
    /// Fixed direction in the viewer frame.
    Fixed([f32; 3]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedAnnotation {
    pub id: String,
    pub kind: AnnotationKind,
    /// The building that the annotation belongs to, `None` for world annotations.
    pub owner_id: Option<String>,
    pub text: String,
    pub size: f64,
    pub scale_with_viewer_distance: bool,
    pub scale_on_selection: bool,
    pub position: [f32; 3],
    pub orientation: Orientation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneBuilding {
    pub id: String,
    pub measured_height: f64,
    pub meshes: Vec<SurfaceMesh>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Surface,
    Annotation,
}

/// A surface or annotation that is in range but could not be placed.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub target: Point3,
    pub range: f64,
    pub buildings: Vec<SceneBuilding>,
    pub annotations: Vec<PlacedAnnotation>,
    pub skipped: Vec<SkippedEntity>,
}

impl Scene {
    pub fn triangle_count(&self) -> usize {
        self.buildings
            .iter()
            .flat_map(|b| b.meshes.iter())
            .map(|m| m.triangle_count())
            .sum()
    }
}

/// Annotation placement in the dataset frame. These do not depend on the store or on
/// the target.
pub mod placement {
    use log::warn;

    use crate::geometry::ground_surface;
    use crate::model::{AnnotationProperties, Building, Surface};
    use crate::spatial_structs::Point3;

    /// The point above the roof: the center of the ground surface raised by the height
    /// of the building and `roof_offset`. Without a ground surface (declared, or inferred
    /// for LoD1), the bottom center of the building is used.
    pub fn building_annotation_position(building: &Building, roof_offset: f64) -> Option<Point3> {
        let base = ground_surface(building)
            .and_then(|ground| ground.bbox().ground_center())
            .or_else(|| building.bbox().base_center())?;
        Some(above(&base, building.measured_height, roof_offset))
    }

    pub fn above(base: &Point3, height: f64, roof_offset: f64) -> Point3 {
        [base[0], base[1], base[2] + height + roof_offset]
    }

    /// The base edge of a surface annotation. The edge wraps around the ring; an anchor
    /// past the last point is clamped to the last point.
    pub fn anchor_edge(surface: &Surface, anchor_index: usize) -> Option<(Point3, Point3)> {
        let n = surface.points.len();
        if n < 2 {
            return None;
        }
        let anchor = if anchor_index >= n {
            warn!(
                "Anchor index {} is out of range for surface {} with {} points, using {}",
                anchor_index,
                &surface.id,
                n,
                n - 1
            );
            n - 1
        } else {
            anchor_index
        };
        surface.edge(anchor)
    }

    /// The point at `relative_position` along the base edge, moved by `surface_offset`
    /// along the surface normal and raised by `height_above_base_line`.
    pub fn surface_annotation_position(
        edge: &(Point3, Point3),
        normal: &Point3,
        relative_position: f64,
        height_above_base_line: f64,
        surface_offset: f64,
    ) -> Point3 {
        let (start, end) = edge;
        let mut position = [0.0; 3];
        for axis in 0..3 {
            position[axis] = start[axis]
                + (end[axis] - start[axis]) * relative_position
                + normal[axis] * surface_offset;
        }
        position[2] += height_above_base_line;
        position
    }

    /// The direction the annotation points to, in the dataset frame. `None` means that it
    /// faces the viewer.
    pub fn pointing_direction(
        properties: &AnnotationProperties,
        default: Option<Point3>,
    ) -> Option<Point3> {
        if properties.faces_viewer() {
            default
        } else {
            Some(properties.pointing_direction)
        }
    }
}

fn orientation(
    frame: &Frame,
    properties: &AnnotationProperties,
    default: Option<Point3>,
) -> Result<Orientation, PrecisionError> {
    match placement::pointing_direction(properties, default) {
        None => Ok(Orientation::FaceViewer),
        Some(direction) => Ok(Orientation::Fixed(frame.direction(&direction)?)),
    }
}

fn placed(annotation: &Annotation, position: [f32; 3], orientation: Orientation) -> PlacedAnnotation {
    let (text, size) = match annotation.content() {
        AnnotationContent::Text { text, size } => (text.clone(), *size),
    };
    let properties = annotation.properties();
    PlacedAnnotation {
        id: annotation.id().to_string(),
        kind: annotation.kind(),
        owner_id: annotation.owner_id().map(str::to_string),
        text,
        size,
        scale_with_viewer_distance: properties.scale_with_viewer_distance,
        scale_on_selection: properties.scale_on_selection,
        position,
        orientation,
    }
}

/// Assembles a [`Scene`] from the store.
#[derive(Clone, Copy)]
pub struct SceneBuilder<'s> {
    store: &'s SpatialStore,
    range: f64,
    roof_offset: f64,
    surface_offset: f64,
}

impl<'s> SceneBuilder<'s> {
    pub fn new(store: &'s SpatialStore) -> Self {
        Self {
            store,
            range: DEFAULT_RANGE,
            roof_offset: ROOF_OFFSET,
            surface_offset: SURFACE_OFFSET,
        }
    }

    pub fn from_config(store: &'s SpatialStore, config: &Config) -> Self {
        Self::new(store)
            .range(config.range)
            .roof_offset(config.roof_offset)
            .surface_offset(config.surface_offset)
    }

    pub fn range(mut self, range: f64) -> Self {
        self.range = range;
        self
    }

    pub fn roof_offset(mut self, roof_offset: f64) -> Self {
        self.roof_offset = roof_offset;
        self
    }

    pub fn surface_offset(mut self, surface_offset: f64) -> Self {
        self.surface_offset = surface_offset;
        self
    }

    /// Query the store around `target` and place everything in the viewer frame of the
    /// target. Surfaces and annotations that cannot be placed are skipped and listed in
    /// [`Scene::skipped`].
    pub fn build(&self, target: Point3) -> Result<Scene, SceneError> {
        if !(self.range.is_finite() && self.range > 0.0) {
            return Err(SceneError::InvalidRange(self.range));
        }
        let range = BoundingBox::around(&target, self.range);
        let frame = Frame::new(target);
        let mut scene = Scene {
            target,
            range: self.range,
            buildings: Vec::new(),
            annotations: Vec::new(),
            skipped: Vec::new(),
        };

        let buildings = self.store.query_buildings(&range)?;
        for building in &buildings {
            let meshes = self.building_meshes(building, &frame, &mut scene.skipped);
            scene.buildings.push(SceneBuilding {
                id: building.id.clone(),
                measured_height: building.measured_height,
                meshes,
            });
        }
        let buildings: HashMap<String, Building> =
            buildings.into_iter().map(|b| (b.id.clone(), b)).collect();

        for record in self.store.query_building_annotations(&range, &buildings)? {
            self.place_building_annotation(record, &frame, &mut scene);
        }
        for record in self.store.query_surface_annotations(&range, &buildings)? {
            self.place_surface_annotation(record, &frame, &mut scene);
        }
        for annotation in self.store.query_world_annotations(&range)? {
            let position = annotation.position;
            place(&mut scene, &frame, Annotation::World(annotation), &position, None);
        }

        info!(
            "Scene around [{}, {}, {}]: {} buildings, {} triangles, {} annotations, {} skipped",
            target[0],
            target[1],
            target[2],
            scene.buildings.len(),
            scene.triangle_count(),
            scene.annotations.len(),
            scene.skipped.len()
        );
        Ok(scene)
    }

    fn building_meshes(
        &self,
        building: &Building,
        frame: &Frame,
        skipped: &mut Vec<SkippedEntity>,
    ) -> Vec<SurfaceMesh> {
        // LoD1 buildings have no semantics, their lowest surface is rendered as ground.
        let ground_id = ground_surface(building).map(|s| s.id.as_str());
        let mut meshes = Vec::with_capacity(building.surface_count());
        for surface in building.surfaces() {
            let as_ground = surface.surface_type == SurfaceType::GroundSurface
                || ground_id == Some(surface.id.as_str());
            match SurfaceMesh::build_as(surface, frame, as_ground) {
                Ok(mesh) => meshes.push(mesh),
                Err(e) => skip(skipped, &surface.id, EntityKind::Surface, e),
            }
        }
        debug!(
            "Building {}: {} of {} surfaces triangulated",
            &building.id,
            meshes.len(),
            building.surface_count()
        );
        meshes
    }

    fn place_building_annotation(
        &self,
        record: AnnotationRecord<BuildingAnnotation>,
        frame: &Frame,
        scene: &mut Scene,
    ) {
        let annotation = &record.annotation;
        let position = match &record.owner {
            Owner::Building(building) => {
                placement::building_annotation_position(building, self.roof_offset)
            }
            Owner::Placeholder(owner) => match (owner.bbox.base_center(), owner.measured_height) {
                (Some(base), Some(height)) => Some(placement::above(&base, height, self.roof_offset)),
                _ => None,
            },
        };
        let Some(position) = position else {
            skip(
                &mut scene.skipped,
                &annotation.id,
                EntityKind::Annotation,
                format!("building {} has no geometry", &annotation.building_id),
            );
            return;
        };
        place(scene, frame, Annotation::Building(record.annotation), &position, None);
    }

    fn place_surface_annotation(
        &self,
        record: AnnotationRecord<SurfaceAnnotation>,
        frame: &Frame,
        scene: &mut Scene,
    ) {
        let annotation = &record.annotation;
        let base: Result<((Point3, Point3), Point3), String> = match &record.owner {
            Owner::Building(building) => building
                .surface(&annotation.surface_id)
                .ok_or_else(|| format!("surface {} is missing", &annotation.surface_id))
                .and_then(|surface| {
                    let edge = placement::anchor_edge(surface, annotation.anchor_index)
                        .ok_or_else(|| format!("surface {} has no edges", &surface.id))?;
                    let normal = estimate_normal(&surface.points)
                        .map_err(|e: GeometryError| e.to_string())?;
                    Ok((edge, normal))
                }),
            Owner::Placeholder(owner) => match (owner.base_edge, owner.normal) {
                (Some(edge), Some(normal)) => Ok((edge, normal)),
                _ => Err(format!(
                    "the geometry of surface {} is unknown",
                    &annotation.surface_id
                )),
            },
        };
        let (edge, normal) = match base {
            Ok(base) => base,
            Err(reason) => {
                skip(&mut scene.skipped, &annotation.id, EntityKind::Annotation, reason);
                return;
            }
        };
        let position = placement::surface_annotation_position(
            &edge,
            &normal,
            annotation.relative_position,
            annotation.height_above_base_line,
            self.surface_offset,
        );
        let inward = [-normal[0], -normal[1], -normal[2]];
        place(scene, frame, Annotation::Surface(record.annotation), &position, Some(inward));
    }
}

/// Move a placed annotation into the viewer frame and add it to the scene, or list it as
/// skipped.
fn place(
    scene: &mut Scene,
    frame: &Frame,
    annotation: Annotation,
    position: &Point3,
    default_direction: Option<Point3>,
) {
    let res = frame.position(position).and_then(|position| {
        let orientation = orientation(frame, annotation.properties(), default_direction)?;
        Ok(placed(&annotation, position, orientation))
    });
    match res {
        Ok(placed) => scene.annotations.push(placed),
        Err(e) => skip(&mut scene.skipped, annotation.id(), EntityKind::Annotation, e),
    }
}

fn skip<E: ToString>(skipped: &mut Vec<SkippedEntity>, id: &str, kind: EntityKind, reason: E) {
    let reason = reason.to_string();
    warn!("Skipping {:?} {}: {}", kind, id, &reason);
    skipped.push(SkippedEntity {
        id: id.to_string(),
        kind,
        reason,
    });
}

/// Turns target detections into scenes.
///
/// A target that is detected again right after itself does not produce a new scene.
pub struct TargetDetector<'s> {
    builder: SceneBuilder<'s>,
    targets: BTreeMap<String, Point3>,
    last_target: Option<String>,
}

impl<'s> TargetDetector<'s> {
    pub fn new(builder: SceneBuilder<'s>, targets: BTreeMap<String, Point3>) -> Self {
        Self {
            builder,
            targets,
            last_target: None,
        }
    }

    pub fn from_config(store: &'s SpatialStore, config: &Config) -> Self {
        Self::new(SceneBuilder::from_config(store, config), config.targets.clone())
    }

    pub fn last_target(&self) -> Option<&str> {
        self.last_target.as_deref()
    }

    /// Returns `None` if `name` is the target that was detected last.
    pub fn on_target_detected(&mut self, name: &str) -> Result<Option<Scene>, SceneError> {
        if self.last_target.as_deref() == Some(name) {
            debug!("Target {} is already active", name);
            return Ok(None);
        }
        let target = *self
            .targets
            .get(name)
            .ok_or_else(|| SceneError::UnknownTarget(name.to_string()))?;
        info!("Target {} detected", name);
        let scene = self.builder.build(target)?;
        self.last_target = Some(name.to_string());
        Ok(Some(scene))
    }

    /// Forget the last target, so that the next detection always builds a scene.
    pub fn reset(&mut self) {
        self.last_target = None;
    }
}
