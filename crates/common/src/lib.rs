//! Shared value types for the gridspace workspace.
//!
//! Nothing here knows about grids: these are the opaque object ids, tag sets
//! and bounding volumes the spatial system consumes.

mod bounds;
mod frustum;
mod tags;
mod types;

pub use bounds::{Aabb, BoundingBoxSphere, Sphere};
pub use frustum::{Frustum, Plane, plane_index};
pub use tags::{Tag, TagRegistry, TagSet};
pub use types::EntityId;

pub fn crate_info() -> &'static str {
    "gridspace-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
