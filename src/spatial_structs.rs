//! Spatial data structures for bounding the buildings and querying the store.
use std::fmt::{Display, Formatter};

use serde::Serialize;

/// A point in the absolute coordinates of the dataset.
///
/// [x, y, z], z is up.
pub type Point3 = [f64; 3];

/// 3D axis-aligned bounding box.
///
/// A box is either `Empty`, or it has two corners with `min <= max` on every axis.
/// A box that was seeded from a single point is a valid, degenerate `Bounds`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BoundingBox {
    #[default]
    Empty,
    Bounds { min: Point3, max: Point3 },
}

impl Display for BoundingBox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundingBox::Empty => write!(f, "BoundingBox(empty)"),
            BoundingBox::Bounds { min, max } => write!(
                f,
                "BoundingBox([{}, {}, {}], [{}, {}, {}])",
                min[0], min[1], min[2], max[0], max[1], max[2]
            ),
        }
    }
}

impl BoundingBox {
    pub fn empty() -> Self {
        BoundingBox::Empty
    }

    pub fn from_point(point: &Point3) -> Self {
        BoundingBox::Bounds {
            min: *point,
            max: *point,
        }
    }

    pub fn from_points<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a Point3>,
    {
        let mut bbox = BoundingBox::Empty;
        bbox.extend_points(points);
        bbox
    }

    /// Create a box from two corners, in any order.
    pub fn from_corners(a: &Point3, b: &Point3) -> Self {
        let mut bbox = BoundingBox::from_point(a);
        bbox.extend_point(b);
        bbox
    }

    /// Square range in the XY plane, centered on `center`, with a side length of
    /// `range`. The Z extent is unbounded.
    pub fn around(center: &Point3, range: f64) -> Self {
        let half = range.abs() / 2.0;
        BoundingBox::Bounds {
            min: [center[0] - half, center[1] - half, f64::NEG_INFINITY],
            max: [center[0] + half, center[1] + half, f64::INFINITY],
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self, BoundingBox::Bounds { .. })
    }

    pub fn min(&self) -> Option<Point3> {
        match self {
            BoundingBox::Empty => None,
            BoundingBox::Bounds { min, .. } => Some(*min),
        }
    }

    pub fn max(&self) -> Option<Point3> {
        match self {
            BoundingBox::Empty => None,
            BoundingBox::Bounds { max, .. } => Some(*max),
        }
    }

    /// Grow the box so that it contains `point`. The first point seeds both corners.
    pub fn extend_point(&mut self, point: &Point3) {
        match self {
            BoundingBox::Empty => *self = BoundingBox::from_point(point),
            BoundingBox::Bounds { min, max } => {
                for axis in 0..3 {
                    if point[axis] < min[axis] {
                        min[axis] = point[axis];
                    }
                    if point[axis] > max[axis] {
                        max[axis] = point[axis];
                    }
                }
            }
        }
    }

    pub fn extend_points<'a, I>(&mut self, points: I)
    where
        I: IntoIterator<Item = &'a Point3>,
    {
        for point in points {
            self.extend_point(point);
        }
    }

    /// Update with another bounding box. An empty box is skipped, so that an invalid
    /// box never propagates into this one.
    pub fn extend_box(&mut self, other: &BoundingBox) {
        if let BoundingBox::Bounds { min, max } = other {
            self.extend_point(min);
            self.extend_point(max);
        }
    }

    /// Center of the box on all three axes. Meant for the box of a ground surface, where
    /// Z is the mid-height of the (possibly sloped) ground; see [`BoundingBox::base_center`]
    /// for the bottom of a whole building.
    pub fn ground_center(&self) -> Option<Point3> {
        match self {
            BoundingBox::Empty => None,
            BoundingBox::Bounds { min, max } => Some([
                (min[0] + max[0]) / 2.0,
                (min[1] + max[1]) / 2.0,
                (min[2] + max[2]) / 2.0,
            ]),
        }
    }

    /// Center of the bottom face of the box: XY center at the minimum Z.
    pub fn base_center(&self) -> Option<Point3> {
        match self {
            BoundingBox::Empty => None,
            BoundingBox::Bounds { min, max } => Some([
                (min[0] + max[0]) / 2.0,
                (min[1] + max[1]) / 2.0,
                min[2],
            ]),
        }
    }

    pub fn contains_point(&self, point: &Point3) -> bool {
        match self {
            BoundingBox::Empty => false,
            BoundingBox::Bounds { min, max } => {
                (0..3).all(|axis| min[axis] <= point[axis] && point[axis] <= max[axis])
            }
        }
    }

    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        match other {
            BoundingBox::Empty => false,
            BoundingBox::Bounds { min, max } => self.contains_point(min) && self.contains_point(max),
        }
    }

    /// Inclusive intersection test on all three axes. Boxes that only touch, intersect.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        match (self, other) {
            (
                BoundingBox::Bounds { min, max },
                BoundingBox::Bounds {
                    min: other_min,
                    max: other_max,
                },
            ) => (0..3).all(|axis| min[axis] <= other_max[axis] && other_min[axis] <= max[axis]),
            _ => false,
        }
    }
}
