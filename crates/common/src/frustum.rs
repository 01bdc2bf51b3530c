use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::bounds::{Aabb, Sphere};

/// Plane `normal · p + d = 0`. Positive signed distance is outside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    pub fn new(normal: Vec3, d: f32) -> Self {
        Self { normal, d }
    }

    /// Plane through `point` whose normal points away from the kept half-space.
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize();
        Self {
            normal,
            d: -normal.dot(point),
        }
    }

    pub fn signed_distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.d
    }

    /// Normalize an `(a, b, c, d)` vector and flip it so the normal points outward.
    fn outward_from_inward(v: Vec4) -> Self {
        let len = v.truncate().length();
        let v = -v / len;
        Self {
            normal: v.truncate(),
            d: v.w,
        }
    }
}

/// Index of each plane in [`Frustum::planes`].
pub mod plane_index {
    pub const NEAR: usize = 0;
    pub const FAR: usize = 1;
    pub const LEFT: usize = 2;
    pub const RIGHT: usize = 3;
    pub const BOTTOM: usize = 4;
    pub const TOP: usize = 5;
}

/// Six outward-facing planes bounding a view volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    pub fn from_planes(planes: [Plane; 6]) -> Self {
        Self { planes }
    }

    /// Extract the planes of a view-projection matrix with a `[0, 1]` depth range
    /// (the convention of `Mat4::perspective_rh`).
    pub fn from_view_projection(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        let mut planes = [Plane::new(Vec3::ZERO, 0.0); 6];
        planes[plane_index::NEAR] = Plane::outward_from_inward(r2);
        planes[plane_index::FAR] = Plane::outward_from_inward(r3 - r2);
        planes[plane_index::LEFT] = Plane::outward_from_inward(r3 + r0);
        planes[plane_index::RIGHT] = Plane::outward_from_inward(r3 - r0);
        planes[plane_index::BOTTOM] = Plane::outward_from_inward(r3 + r1);
        planes[plane_index::TOP] = Plane::outward_from_inward(r3 - r1);
        Self { planes }
    }

    /// Perspective frustum for a camera at `eye` looking at `target`.
    pub fn perspective(eye: Vec3, target: Vec3, fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        let proj = Mat4::perspective_rh(fov_y_radians, aspect, near, far);
        Self::from_view_projection(&(proj * view))
    }

    /// Conservative sphere test: false only if the sphere is fully outside one plane.
    pub fn intersects_sphere(&self, sphere: &Sphere) -> bool {
        self.planes
            .iter()
            .all(|p| p.signed_distance(sphere.center) <= sphere.radius)
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(p) <= 0.0)
    }

    /// The eight corners, near plane first (LB, RB, LT, RT), then the far plane.
    /// `None` if three of the planes do not meet in a point.
    pub fn corner_points(&self) -> Option<[Vec3; 8]> {
        use plane_index::*;
        let mut out = [Vec3::ZERO; 8];
        let mut i = 0;
        for depth in [NEAR, FAR] {
            for vertical in [BOTTOM, TOP] {
                for horizontal in [LEFT, RIGHT] {
                    out[i] = intersect_planes(
                        &self.planes[depth],
                        &self.planes[vertical],
                        &self.planes[horizontal],
                    )?;
                    i += 1;
                }
            }
        }
        Some(out)
    }

    /// Box around the corner points.
    pub fn bounding_box(&self) -> Option<Aabb> {
        Aabb::from_points(&self.corner_points()?)
    }
}

fn intersect_planes(a: &Plane, b: &Plane, c: &Plane) -> Option<Vec3> {
    let bc = b.normal.cross(c.normal);
    let denom = a.normal.dot(bc);
    if denom.abs() < 1e-6 {
        return None;
    }
    let ca = c.normal.cross(a.normal);
    let ab = a.normal.cross(b.normal);
    let p = (bc * -a.d + ca * -b.d + ab * -c.d) / denom;
    p.is_finite().then_some(p)
}
