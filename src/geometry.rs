//! Surface normals and triangulation of planar building surfaces.
//!
//! Surfaces are triangulated in the dataset frame. The polygon is rotated so that its
//! normal points along +Z, the Z coordinate is dropped and the 2D ring is ear-clipped.
//! [`SurfaceMesh`] then moves the result into the viewer frame of a target.
use log::{debug, warn};
use thiserror::Error;

use crate::model::{Building, Surface, SurfaceType};
use crate::spatial_structs::Point3;
use crate::transform::{narrow, to_local_frame, to_viewer_axes, Frame, PrecisionError};

/// Two unit normals closer than this (cosine of the angle) are considered parallel.
const PARALLEL_COS: f64 = 0.999;
/// Cross products shorter than this are treated as collinear.
const DEGENERATE_LENGTH: f64 = 1e-12;
/// Smallest doubled area of a 2D ear that is clipped.
const EAR_EPSILON: f64 = 1e-12;

#[derive(Error, Debug, PartialEq)]
pub enum GeometryError {
    #[error("A surface needs at least 3 points to be triangulated, found {0}")]
    NotTriangulable(usize),
    #[error("All points of the surface are collinear")]
    Degenerate,
    #[error("Could not triangulate the polygon, it is probably self-intersecting")]
    NoEars,
    #[error(transparent)]
    Precision(#[from] PrecisionError),
}

fn sub(a: &Point3, b: &Point3) -> Point3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: &Point3, b: &Point3) -> Point3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: &Point3, b: &Point3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn length(a: &Point3) -> f64 {
    dot(a, a).sqrt()
}

fn normalize(a: &Point3) -> Option<Point3> {
    let len = length(a);
    if len < DEGENERATE_LENGTH || !len.is_finite() {
        None
    } else {
        Some([a[0] / len, a[1] / len, a[2] / len])
    }
}

fn negate(a: &Point3) -> Point3 {
    [-a[0], -a[1], -a[2]]
}

/// Unit normal of the corner at `points[i]`, spanned by its neighbours on the ring.
fn corner_normal(points: &[Point3], i: usize) -> Option<Point3> {
    let n = points.len();
    let a = &points[i % n];
    let b = &points[(i + 1) % n];
    let c = &points[(i + 2) % n];
    normalize(&cross(&sub(b, a), &sub(c, a)))
}

/// Estimate the unit normal of a planar polygon.
///
/// The normal of the first triangle is the candidate. Every other consecutive triple of
/// the ring votes for the candidate or for its opposite, and the majority wins (ties go
/// to the candidate). Triples that agree with neither are coplanarity violations, they
/// are logged but do not fail the estimate. Collinear triples do not vote.
pub fn estimate_normal(points: &[Point3]) -> Result<Point3, GeometryError> {
    let n = points.len();
    if n < 3 {
        return Err(GeometryError::NotTriangulable(n));
    }
    let (first, candidate) = (0..n)
        .find_map(|i| corner_normal(points, i).map(|normal| (i, normal)))
        .ok_or(GeometryError::Degenerate)?;

    let mut agree = 1_usize;
    let mut opposite = 0_usize;
    let mut violations = 0_usize;
    for i in (first + 1)..n {
        if let Some(normal) = corner_normal(points, i) {
            let cos = dot(&normal, &candidate);
            if cos >= PARALLEL_COS {
                agree += 1;
            } else if cos <= -PARALLEL_COS {
                opposite += 1;
            } else {
                violations += 1;
            }
        }
    }
    if violations > 0 {
        warn!(
            "{} of {} corners are not coplanar with the rest of the polygon",
            violations, n
        );
    }
    if agree >= opposite {
        Ok(candidate)
    } else {
        Ok(negate(&candidate))
    }
}

/// Area of a planar 3D polygon, from its Newell normal.
pub fn polygon_area(points: &[Point3]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let origin = points[0];
    let mut sum = [0.0; 3];
    for i in 0..points.len() {
        let a = sub(&points[i], &origin);
        let b = sub(&points[(i + 1) % points.len()], &origin);
        let c = cross(&a, &b);
        sum = [sum[0] + c[0], sum[1] + c[1], sum[2] + c[2]];
    }
    length(&sum) / 2.0
}

/// Row-major rotation matrix that turns the unit vector `normal` onto the unit vector
/// `axis` (Rodrigues).
pub fn rotation_to_axis(normal: &Point3, axis: &Point3) -> [[f64; 3]; 3] {
    let cos = dot(normal, axis);
    let k = cross(normal, axis);
    let sin = length(&k);
    if sin < DEGENERATE_LENGTH {
        if cos > 0.0 {
            return [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        }
        // half turn around any axis that is perpendicular to `axis`
        let helper = if axis[0].abs() < 0.9 {
            [1.0, 0.0, 0.0]
        } else {
            [0.0, 1.0, 0.0]
        };
        let [kx, ky, kz] = normalize(&cross(axis, &helper)).unwrap_or([1.0, 0.0, 0.0]);
        return [
            [2.0 * kx * kx - 1.0, 2.0 * kx * ky, 2.0 * kx * kz],
            [2.0 * ky * kx, 2.0 * ky * ky - 1.0, 2.0 * ky * kz],
            [2.0 * kz * kx, 2.0 * kz * ky, 2.0 * kz * kz - 1.0],
        ];
    }
    let [kx, ky, kz] = [k[0] / sin, k[1] / sin, k[2] / sin];
    let t = 1.0 - cos;
    [
        [cos + kx * kx * t, kx * ky * t - kz * sin, kx * kz * t + ky * sin],
        [ky * kx * t + kz * sin, cos + ky * ky * t, ky * kz * t - kx * sin],
        [kz * kx * t - ky * sin, kz * ky * t + kx * sin, cos + kz * kz * t],
    ]
}

pub fn rotation_to_z(normal: &Point3) -> [[f64; 3]; 3] {
    rotation_to_axis(normal, &[0.0, 0.0, 1.0])
}

fn rotate(m: &[[f64; 3]; 3], v: &Point3) -> Point3 {
    [dot(&m[0], v), dot(&m[1], v), dot(&m[2], v)]
}

/// Rotate the polygon into the plane of its normal and drop the third coordinate.
/// The points are first moved to the first point, so that large projected coordinates do
/// not cost precision.
pub fn project_to_plane(points: &[Point3], normal: &Point3) -> Vec<[f64; 2]> {
    let rotation = rotation_to_z(normal);
    let origin = points[0];
    points
        .iter()
        .map(|p| {
            let r = rotate(&rotation, &sub(p, &origin));
            [r[0], r[1]]
        })
        .collect()
}

fn signed_area_2d(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    let mut a = 0.0;
    for q in 0..n {
        let p = if q == 0 { n - 1 } else { q - 1 };
        a += ring[p][0] * ring[q][1] - ring[q][0] * ring[p][1];
    }
    a / 2.0
}

fn inside_triangle(a: &[f64; 2], b: &[f64; 2], c: &[f64; 2], p: &[f64; 2]) -> bool {
    let a_cross_bp = (c[0] - b[0]) * (p[1] - b[1]) - (c[1] - b[1]) * (p[0] - b[0]);
    let c_cross_ap = (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
    let b_cross_cp = (a[0] - c[0]) * (p[1] - c[1]) - (a[1] - c[1]) * (p[0] - c[0]);
    a_cross_bp >= 0.0 && b_cross_cp >= 0.0 && c_cross_ap >= 0.0
}

/// Can the corner `v` (between `u` and `w`) of the remaining ring be cut off?
fn is_ear(ring: &[[f64; 2]], remaining: &[usize], u: usize, v: usize, w: usize) -> bool {
    let a = &ring[remaining[u]];
    let b = &ring[remaining[v]];
    let c = &ring[remaining[w]];
    if (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]) < EAR_EPSILON {
        return false;
    }
    for (p, vertex) in remaining.iter().enumerate() {
        if p == u || p == v || p == w {
            continue;
        }
        if inside_triangle(a, b, c, &ring[*vertex]) {
            return false;
        }
    }
    true
}

/// Ear-clipping of a simple 2D ring. The triangles are counter-clockwise.
pub fn ear_clip(ring: &[[f64; 2]]) -> Vec<usize> {
    let n = ring.len();
    let mut indices: Vec<usize> = Vec::with_capacity(3 * n.saturating_sub(2));
    if n < 3 {
        return indices;
    }
    let mut remaining: Vec<usize> = if signed_area_2d(ring) > 0.0 {
        (0..n).collect()
    } else {
        (0..n).rev().collect()
    };

    let mut nv = n;
    let mut guard = 2 * nv;
    let mut v = nv - 1;
    while nv > 2 {
        if guard == 0 {
            let rest: Vec<[f64; 2]> = remaining.iter().map(|i| ring[*i]).collect();
            if signed_area_2d(&rest).abs() > EAR_EPSILON {
                warn!(
                    "Ear-clipping stopped with {} vertices left, the polygon is not simple",
                    nv
                );
            } else {
                debug!("Ear-clipping left {} collinear vertices", nv);
            }
            break;
        }
        guard -= 1;

        let u = if v >= nv { 0 } else { v };
        v = if u + 1 >= nv { 0 } else { u + 1 };
        let w = if v + 1 >= nv { 0 } else { v + 1 };

        if is_ear(ring, &remaining, u, v, w) {
            indices.extend_from_slice(&[remaining[u], remaining[v], remaining[w]]);
            remaining.remove(v);
            nv -= 1;
            guard = 2 * nv;
        }
    }
    indices
}

/// Triangulate a planar 3D polygon.
///
/// Returns indices into `points`, three per triangle. The triangles wind
/// counter-clockwise around the estimated normal of the polygon.
pub fn triangulate(points: &[Point3]) -> Result<Vec<usize>, GeometryError> {
    if points.len() < 3 {
        return Err(GeometryError::NotTriangulable(points.len()));
    }
    let normal = estimate_normal(points)?;
    let ring = project_to_plane(points, &normal);
    let indices = ear_clip(&ring);
    if indices.is_empty() {
        return Err(GeometryError::NoEars);
    }
    Ok(indices)
}

/// Reverse the winding of every triangle by swapping its first two indices.
pub fn invert_winding<T: Copy>(indices: &mut [T]) {
    for triangle in indices.chunks_exact_mut(3) {
        triangle.swap(0, 1);
    }
}

/// The ground surface of a building without semantic surfaces: the surface with the
/// lowest average height. On equal heights the first surface wins.
pub fn infer_ground_surface(building: &Building) -> Option<&Surface> {
    let mut lowest: Option<(&Surface, f64)> = None;
    for surface in building.surfaces() {
        if let Some(mean_z) = surface.mean_z() {
            match lowest {
                Some((_, z)) if mean_z >= z => {}
                _ => lowest = Some((surface, mean_z)),
            }
        }
    }
    lowest.map(|(surface, _)| surface)
}

/// The declared ground surface. Only LoD1 buildings, which have no semantics, fall back
/// to the inferred one; a LoD2 building without a ground surface has none.
pub fn ground_surface(building: &Building) -> Option<&Surface> {
    match building.ground_surface() {
        Some(ground) => Some(ground),
        None if building.is_lod1() => infer_ground_surface(building),
        None => None,
    }
}

/// Renderable triangles of one surface, in the viewer frame of a target.
///
/// For every triangle, `(b - a) x (c - a)` in viewer coordinates points along the vertex
/// normals. Ground surfaces are turned around, so that they face the same way as the
/// roofs.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceMesh {
    pub surface_id: String,
    pub surface_type: SurfaceType,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

impl SurfaceMesh {
    pub fn build(surface: &Surface, frame: &Frame) -> Result<Self, GeometryError> {
        let as_ground = surface.surface_type == SurfaceType::GroundSurface;
        SurfaceMesh::build_as(surface, frame, as_ground)
    }

    /// Build the mesh, rendering the surface as a ground surface (visible from above)
    /// when `as_ground` is set. Used for the inferred ground of LoD1 buildings.
    pub fn build_as(surface: &Surface, frame: &Frame, as_ground: bool) -> Result<Self, GeometryError> {
        // small coordinates around the target
        let local = surface.map_points(|p| to_local_frame(p, &frame.origin));
        let normal = estimate_normal(&local.points)?;
        let mut indices: Vec<u32> = triangulate(&local.points)?
            .into_iter()
            .map(|i| i as u32)
            .collect();
        let positions = local
            .points
            .iter()
            .map(|p| narrow(&to_viewer_axes(p)))
            .collect::<Result<Vec<_>, _>>()?;

        // The axis swap into the viewer frame mirrors the geometry, which reverses the
        // winding of the triangles.
        let vertex_normal = if as_ground {
            frame.direction(&negate(&normal))?
        } else {
            invert_winding(&mut indices);
            frame.direction(&normal)?
        };
        Ok(Self {
            surface_id: surface.id.clone(),
            surface_type: surface.surface_type,
            normals: vec![vertex_normal; positions.len()],
            positions,
            indices,
        })
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn triangles_area(points: &[Point3], indices: &[usize]) -> f64 {
        indices
            .chunks_exact(3)
            .map(|t| polygon_area(&[points[t[0]], points[t[1]], points[t[2]]]))
            .sum()
    }

    fn wall(x0: f64, y0: f64, x1: f64, y1: f64, h: f64) -> Vec<Point3> {
        vec![
            [x0, y0, 0.0],
            [x1, y1, 0.0],
            [x1, y1, h],
            [x0, y0, h],
        ]
    }

    /// A regular convex polygon in a tilted plane, far away from the origin.
    fn tilted_polygon(n: usize) -> Vec<Point3> {
        let origin = [33310550.0, 5995765.0, 30.0];
        let u = [1.0 / 2_f64.sqrt(), 0.0, 1.0 / 2_f64.sqrt()];
        let v = [0.0, 1.0, 0.0];
        (0..n)
            .map(|i| {
                let a = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
                let (s, c) = (5.0 * a.sin(), 5.0 * a.cos());
                [
                    origin[0] + c * u[0] + s * v[0],
                    origin[1] + c * u[1] + s * v[1],
                    origin[2] + c * u[2] + s * v[2],
                ]
            })
            .collect()
    }

    #[test]
    fn test_estimate_normal_unit_square() {
        let square = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]];
        assert_eq!(estimate_normal(&square), Ok([0.0, 0.0, 1.0]));
        let reversed: Vec<Point3> = square.iter().rev().copied().collect();
        assert_eq!(estimate_normal(&reversed), Ok([0.0, 0.0, -1.0]));
    }

    #[test]
    fn test_rotation_to_axis() {
        let s = 1.0 / 3_f64.sqrt();
        for normal in [[s, s, s], [0.0, 0.0, -1.0], [0.0, 0.0, 1.0], [-1.0, 0.0, 0.0]] {
            for axis in [[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]] {
                let r = rotate(&rotation_to_axis(&normal, &axis), &normal);
                for i in 0..3 {
                    assert_abs_diff_eq!(r[i], axis[i], epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_estimate_normal_orthogonal_to_edges() {
        for points in [tilted_polygon(3), tilted_polygon(7), wall(0.0, 0.0, 3.0, 4.0, 2.5)] {
            let normal = estimate_normal(&points).unwrap();
            assert_abs_diff_eq!(length(&normal), 1.0, epsilon = 1e-9);
            for i in 0..points.len() {
                let edge = sub(&points[(i + 1) % points.len()], &points[i]);
                assert_abs_diff_eq!(dot(&normal, &edge), 0.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_estimate_normal_majority_on_concave_polygon() {
        // L-shape, counter-clockwise seen from above. The first corner is reflex, so the
        // first triangle points down and is outvoted.
        let l_shape = vec![
            [2.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [1.0, 2.0, 0.0],
            [0.0, 2.0, 0.0],
            [0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
        ];
        assert!(corner_normal(&l_shape, 0).unwrap()[2] < 0.0);
        let normal = estimate_normal(&l_shape).unwrap();
        assert_abs_diff_eq!(normal[2], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_normal_skips_collinear_start() {
        let points = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [2.0, 1.0, 0.0]];
        assert_eq!(estimate_normal(&points), Ok([0.0, 0.0, 1.0]));
        let line = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        assert_eq!(estimate_normal(&line), Err(GeometryError::Degenerate));
    }

    #[test]
    fn test_triangulate_convex_polygons() {
        for n in 3..12 {
            let points = tilted_polygon(n);
            let indices = triangulate(&points).unwrap();
            assert_eq!(indices.len(), 3 * (n - 2));
            assert!(indices.iter().all(|i| *i < n));
            assert_abs_diff_eq!(
                triangles_area(&points, &indices),
                polygon_area(&points),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_triangulate_concave_polygon() {
        let l_shape = vec![
            [0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [2.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [1.0, 2.0, 0.0],
            [0.0, 2.0, 0.0],
        ];
        let indices = triangulate(&l_shape).unwrap();
        assert_eq!(indices.len(), 12);
        assert_abs_diff_eq!(triangles_area(&l_shape, &indices), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_triangulate_ring_with_collinear_points() {
        // 2 x 1 rectangle with a point halfway along both long sides
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [2.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
        ];
        let indices = triangulate(&points).unwrap();
        assert_eq!(indices.len(), 12);
        assert_abs_diff_eq!(triangles_area(&points, &indices), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_non_coplanar_points_are_not_fatal() {
        let warped = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.3], [0.0, 1.0, 0.0]];
        let normal = estimate_normal(&warped).unwrap();
        assert!(normal[2] > 0.9);
        assert_eq!(triangulate(&warped).unwrap().len(), 6);
    }

    #[test]
    fn test_triangles_follow_the_normal() {
        let points = wall(0.0, 0.0, 4.0, 0.0, 3.0);
        let normal = estimate_normal(&points).unwrap();
        let indices = triangulate(&points).unwrap();
        for t in indices.chunks_exact(3) {
            let n = cross(
                &sub(&points[t[1]], &points[t[0]]),
                &sub(&points[t[2]], &points[t[0]]),
            );
            assert!(dot(&n, &normal) > 0.0);
        }
    }

    #[test]
    fn test_triangulate_too_few_points() {
        let points = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        assert_eq!(triangulate(&points), Err(GeometryError::NotTriangulable(2)));
    }

    #[test]
    fn test_invert_winding() {
        let mut indices = vec![0, 1, 2, 0, 2, 3];
        invert_winding(&mut indices);
        assert_eq!(indices, vec![1, 0, 2, 2, 0, 3]);
    }

    #[test]
    fn test_infer_ground_surface_first_wins() {
        let mut building = Building::new("b", 3.0);
        building.add_surface(Surface::with_points("wall", SurfaceType::Undefined, wall(0.0, 0.0, 1.0, 0.0, 3.0)));
        let floor = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]];
        building.add_surface(Surface::with_points("floor-a", SurfaceType::Undefined, floor.clone()));
        building.add_surface(Surface::with_points("floor-b", SurfaceType::Undefined, floor));
        assert_eq!(infer_ground_surface(&building).map(|s| s.id.as_str()), Some("floor-a"));
        assert_eq!(ground_surface(&building).map(|s| s.id.as_str()), Some("floor-a"));
    }

    #[test]
    fn test_no_inferred_ground_with_semantics() {
        let mut building = Building::new("b", 3.0);
        building.add_surface(Surface::with_points("wall", SurfaceType::WallSurface, wall(0.0, 0.0, 1.0, 0.0, 3.0)));
        let roof = vec![[0.0, 0.0, 3.0], [1.0, 0.0, 3.0], [1.0, 1.0, 3.0], [0.0, 1.0, 3.0]];
        building.add_surface(Surface::with_points("roof", SurfaceType::RoofSurface, roof));
        assert!(infer_ground_surface(&building).is_some());
        assert_eq!(ground_surface(&building), None);
    }

    #[test]
    fn test_surface_mesh_faces_its_normals() {
        let origin = [100.0, 200.0, 0.0];
        let frame = Frame::new(origin);
        let roof = Surface::with_points(
            "roof",
            SurfaceType::RoofSurface,
            vec![[100.0, 200.0, 3.0], [101.0, 200.0, 3.0], [101.0, 201.0, 3.0], [100.0, 201.0, 3.0]],
        );
        let ground = Surface::with_points(
            "ground",
            SurfaceType::GroundSurface,
            vec![[100.0, 200.0, 0.0], [100.0, 201.0, 0.0], [101.0, 201.0, 0.0], [101.0, 200.0, 0.0]],
        );
        for surface in [&roof, &ground] {
            let mesh = SurfaceMesh::build(surface, &frame).unwrap();
            assert_eq!(mesh.triangle_count(), 2);
            // Both face up (+Y in the viewer frame).
            assert_abs_diff_eq!(mesh.normals[0][1], 1.0, epsilon = 1e-6);
            for t in mesh.indices.chunks_exact(3) {
                let p = |i: u32| {
                    let v = mesh.positions[i as usize];
                    [v[0] as f64, v[1] as f64, v[2] as f64]
                };
                let n = cross(&sub(&p(t[1]), &p(t[0])), &sub(&p(t[2]), &p(t[0])));
                let vn = mesh.normals[t[0] as usize];
                assert!(dot(&n, &[vn[0] as f64, vn[1] as f64, vn[2] as f64]) > 0.0);
            }
        }
    }

    #[test]
    fn test_surface_mesh_precision_error() {
        let frame = Frame::new([0.0, 0.0, 0.0]);
        let surface = Surface::with_points("far", SurfaceType::WallSurface, tilted_polygon(4));
        assert!(matches!(
            SurfaceMesh::build(&surface, &frame),
            Err(GeometryError::Precision(_))
        ));
    }
}
