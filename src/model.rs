//! Buildings, surfaces and annotations as they are read from CityGML and stored in the
//! spatial store.
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::spatial_structs::{BoundingBox, Point3};

/// Semantic class of a boundary surface. LoD1 solids carry no semantics, so their
/// surfaces are `Undefined`.
#[derive(Debug, Default, Clone, Copy, Hash, Eq, PartialEq)]
pub enum SurfaceType {
    GroundSurface,
    WallSurface,
    RoofSurface,
    #[default]
    Undefined,
}

impl SurfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceType::GroundSurface => "GroundSurface",
            SurfaceType::WallSurface => "WallSurface",
            SurfaceType::RoofSurface => "RoofSurface",
            SurfaceType::Undefined => "Undefined",
        }
    }
}

impl Display for SurfaceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SurfaceType {
    type Err = std::convert::Infallible;

    /// Unknown names map to `Undefined`, same as boundary surfaces that the reader
    /// does not classify (eg. `ClosureSurface`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GroundSurface" => SurfaceType::GroundSurface,
            "WallSurface" => SurfaceType::WallSurface,
            "RoofSurface" => SurfaceType::RoofSurface,
            _ => SurfaceType::Undefined,
        })
    }
}

/// A planar polygon, implicitly closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub id: String,
    pub surface_type: SurfaceType,
    pub points: Vec<Point3>,
}

impl Surface {
    pub fn new(id: impl Into<String>, surface_type: SurfaceType) -> Self {
        Self {
            id: id.into(),
            surface_type,
            points: Vec::new(),
        }
    }

    pub fn with_points(id: impl Into<String>, surface_type: SurfaceType, points: Vec<Point3>) -> Self {
        Self {
            id: id.into(),
            surface_type,
            points,
        }
    }

    /// Append a point, unless it repeats the previous point or closes the ring on the
    /// first point. Returns `true` if the point was added.
    pub fn push_point(&mut self, point: Point3) -> bool {
        if self.points.last() == Some(&point) {
            return false;
        }
        if self.points.len() > 1 && self.points.first() == Some(&point) {
            return false;
        }
        self.points.push(point);
        true
    }

    pub fn is_triangulable(&self) -> bool {
        self.points.len() >= 3
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Average height of the points.
    pub fn mean_z(&self) -> Option<f64> {
        if self.points.is_empty() {
            None
        } else {
            Some(self.points.iter().map(|p| p[2]).sum::<f64>() / self.points.len() as f64)
        }
    }

    /// The edge that starts at point `anchor`. Indices wrap around the ring.
    pub fn edge(&self, anchor: usize) -> Option<(Point3, Point3)> {
        let n = self.points.len();
        if n < 2 {
            return None;
        }
        Some((self.points[anchor % n], self.points[(anchor + 1) % n]))
    }

    /// A new surface with every point passed through `f`.
    pub fn map_points<F>(&self, f: F) -> Surface
    where
        F: Fn(&Point3) -> Point3,
    {
        Surface {
            id: self.id.clone(),
            surface_type: self.surface_type,
            points: self.points.iter().map(f).collect(),
        }
    }
}

/// A building or a building part. Parts are separate buildings, they do not refer to
/// their parent.
#[derive(Debug, Clone, PartialEq)]
pub struct Building {
    pub id: String,
    pub measured_height: f64,
    surfaces: Vec<Surface>,
}

impl Building {
    pub fn new(id: impl Into<String>, measured_height: f64) -> Self {
        Self {
            id: id.into(),
            measured_height,
            surfaces: Vec::new(),
        }
    }

    /// Add a surface, keyed on its id. If the building already has a surface with the
    /// same id, it is replaced in place and the old surface is returned.
    pub fn add_surface(&mut self, surface: Surface) -> Option<Surface> {
        if let Some(existing) = self.surfaces.iter_mut().find(|s| s.id == surface.id) {
            return Some(std::mem::replace(existing, surface));
        }
        self.surfaces.push(surface);
        None
    }

    /// Surfaces in the order they were added.
    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn surface(&self, id: &str) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// The first explicit ground surface. LoD1 buildings have none, see
    /// [`crate::geometry::infer_ground_surface`].
    pub fn ground_surface(&self) -> Option<&Surface> {
        self.surfaces
            .iter()
            .find(|s| s.surface_type == SurfaceType::GroundSurface)
    }

    /// LoD1 buildings: none of the surfaces has a semantic type.
    pub fn is_lod1(&self) -> bool {
        self.surfaces
            .iter()
            .all(|s| s.surface_type == SurfaceType::Undefined)
    }

    /// Union of the points of all surfaces.
    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        for surface in &self.surfaces {
            bbox.extend_points(&surface.points);
        }
        bbox
    }
}

/// Display options shared by all annotation kinds.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct AnnotationProperties {
    pub scale_with_viewer_distance: bool,
    pub scale_on_selection: bool,
    /// A zero vector means that the annotation has no fixed orientation and faces the
    /// viewer.
    pub pointing_direction: Point3,
}

impl AnnotationProperties {
    pub fn faces_viewer(&self) -> bool {
        self.pointing_direction == [0.0, 0.0, 0.0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationContent {
    Text { text: String, size: f64 },
}

/// Annotation above the roof of a building.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingAnnotation {
    pub id: String,
    pub building_id: String,
    pub properties: AnnotationProperties,
    pub content: AnnotationContent,
}

/// Annotation on an edge of a surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceAnnotation {
    pub id: String,
    pub building_id: String,
    pub surface_id: String,
    /// Index of the first point of the base edge, the edge continues to `anchor_index + 1`
    /// (wrapping).
    pub anchor_index: usize,
    /// Position along the base edge, in `[0, 1]`.
    pub relative_position: f64,
    pub height_above_base_line: f64,
    pub properties: AnnotationProperties,
    pub content: AnnotationContent,
}

/// Annotation at an absolute position.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldCoordinateAnnotation {
    pub id: String,
    pub position: Point3,
    pub properties: AnnotationProperties,
    pub content: AnnotationContent,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum AnnotationKind {
    Building,
    Surface,
    World,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Building => "building",
            AnnotationKind::Surface => "surface",
            AnnotationKind::World => "world",
        }
    }
}

/// Any annotation, for the code that treats the three kinds alike.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Building(BuildingAnnotation),
    Surface(SurfaceAnnotation),
    World(WorldCoordinateAnnotation),
}

impl Annotation {
    pub fn id(&self) -> &str {
        match self {
            Annotation::Building(a) => &a.id,
            Annotation::Surface(a) => &a.id,
            Annotation::World(a) => &a.id,
        }
    }

    pub fn kind(&self) -> AnnotationKind {
        match self {
            Annotation::Building(_) => AnnotationKind::Building,
            Annotation::Surface(_) => AnnotationKind::Surface,
            Annotation::World(_) => AnnotationKind::World,
        }
    }

    /// The building the annotation belongs to. World annotations have no owner.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Annotation::Building(a) => Some(&a.building_id),
            Annotation::Surface(a) => Some(&a.building_id),
            Annotation::World(_) => None,
        }
    }

    pub fn properties(&self) -> &AnnotationProperties {
        match self {
            Annotation::Building(a) => &a.properties,
            Annotation::Surface(a) => &a.properties,
            Annotation::World(a) => &a.properties,
        }
    }

    pub fn content(&self) -> &AnnotationContent {
        match self {
            Annotation::Building(a) => &a.content,
            Annotation::Surface(a) => &a.content,
            Annotation::World(a) => &a.content,
        }
    }
}
