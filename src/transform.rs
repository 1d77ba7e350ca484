//! Conversion between the absolute, projected coordinates of the dataset and the local
//! frame of a target.
//!
//! The dataset is Z-up, the viewer is Y-up. The local frame is the viewer frame with its
//! origin on the detected target.
//! Single precision in the viewer is only usable close to the origin, so the narrowing
//! step fails instead of silently losing precision for points that are far away.
use thiserror::Error;

use crate::spatial_structs::Point3;

/// Largest absolute coordinate (in dataset units, eg. meters) that is narrowed to `f32`.
/// At 1e5 an `f32` still resolves to under a centimetre.
pub const MAX_SAFE_LOCAL_OFFSET: f64 = 100_000.0;

#[derive(Error, Debug, PartialEq)]
pub enum PrecisionError {
    #[error("Coordinate component {component} = {value} is farther than {limit} from the origin, move the origin closer to the data")]
    OutOfRange {
        component: usize,
        value: f64,
        limit: f64,
    },
    #[error("Coordinate component {component} is not a finite number")]
    NotFinite { component: usize },
}

/// Express `point` relative to `origin`.
pub fn to_local_frame(point: &Point3, origin: &Point3) -> Point3 {
    [
        point[0] - origin[0],
        point[1] - origin[1],
        point[2] - origin[2],
    ]
}

/// Swap the second and third component, from Z-up to Y-up.
pub fn to_viewer_axes(v: &Point3) -> Point3 {
    [v[0], v[2], v[1]]
}

/// The swap is its own inverse, this is only here for readability at the call site.
pub fn from_viewer_axes(v: &Point3) -> Point3 {
    to_viewer_axes(v)
}

/// Local frame and viewer axes in one step.
pub fn to_viewer_frame(point: &Point3, origin: &Point3) -> Point3 {
    to_viewer_axes(&to_local_frame(point, origin))
}

/// Narrow a local coordinate to single precision.
pub fn narrow(v: &Point3) -> Result<[f32; 3], PrecisionError> {
    for (component, value) in v.iter().enumerate() {
        if !value.is_finite() {
            return Err(PrecisionError::NotFinite { component });
        }
        if value.abs() > MAX_SAFE_LOCAL_OFFSET {
            return Err(PrecisionError::OutOfRange {
                component,
                value: *value,
                limit: MAX_SAFE_LOCAL_OFFSET,
            });
        }
    }
    Ok([v[0] as f32, v[1] as f32, v[2] as f32])
}

/// The viewer frame of one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub origin: Point3,
}

impl Frame {
    pub fn new(origin: Point3) -> Self {
        Self { origin }
    }

    /// Absolute dataset point to a single precision viewer position.
    pub fn position(&self, point: &Point3) -> Result<[f32; 3], PrecisionError> {
        narrow(&to_viewer_frame(point, &self.origin))
    }

    /// Direction vectors are only reordered, never translated.
    pub fn direction(&self, v: &Point3) -> Result<[f32; 3], PrecisionError> {
        narrow(&to_viewer_axes(v))
    }
}
