use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Smallest box enclosing all points. Returns `None` for an empty slice.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        Some(points.iter().skip(1).fold(
            Self {
                min: first,
                max: first,
            },
            |b, p| Self {
                min: b.min.min(*p),
                max: b.max.max(*p),
            },
        ))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// True if `other` lies completely inside this box (touching counts).
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.cmple(p).all() && self.max.cmpge(p).all()
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    pub fn overlaps_sphere(&self, sphere: &Sphere) -> bool {
        let closest = sphere.center.clamp(self.min, self.max);
        closest.distance_squared(sphere.center) <= sphere.radius * sphere.radius
    }

    /// Sphere around the box corners.
    pub fn bounding_sphere(&self) -> Sphere {
        Sphere {
            center: self.center(),
            radius: self.half_extents().length(),
        }
    }
}

/// Bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn overlaps(&self, other: &Sphere) -> bool {
        let r = self.radius + other.radius;
        self.center.distance_squared(other.center) <= r * r
    }

    pub fn overlaps_box(&self, aabb: &Aabb) -> bool {
        aabb.overlaps_sphere(self)
    }

    /// Box enclosing the sphere.
    pub fn bounding_box(&self) -> Aabb {
        Aabb::from_center_half_extents(self.center, Vec3::splat(self.radius))
    }
}

/// Box and sphere sharing one center: the bounding volume tracked per object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxSphere {
    pub center: Vec3,
    pub half_extents: Vec3,
    pub radius: f32,
}

impl BoundingBoxSphere {
    pub fn new(center: Vec3, half_extents: Vec3, radius: f32) -> Self {
        Self {
            center,
            half_extents,
            radius,
        }
    }

    pub fn from_box(aabb: &Aabb) -> Self {
        let half_extents = aabb.half_extents();
        Self {
            center: aabb.center(),
            half_extents,
            radius: half_extents.length(),
        }
    }

    pub fn from_sphere(sphere: &Sphere) -> Self {
        Self {
            center: sphere.center,
            half_extents: Vec3::splat(sphere.radius),
            radius: sphere.radius,
        }
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_center_half_extents(self.center, self.half_extents)
    }

    pub fn sphere(&self) -> Sphere {
        Sphere {
            center: self.center,
            radius: self.radius,
        }
    }
}
