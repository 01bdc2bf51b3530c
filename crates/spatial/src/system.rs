use gridspace_common::{Aabb, BoundingBoxSphere, EntityId, Frustum, Sphere, TagSet};

use crate::error::SpatialError;
use crate::id_table::SpatialDataHandle;
use crate::query::{QueryParams, QueryStats, VisibilityState, VisitorExecution};

/// Callback receiving each object found by a shape query.
pub type QueryCallback<'a> = &'a mut dyn FnMut(EntityId) -> VisitorExecution;

/// Occlusion test: returns true if the box is hidden.
pub type IsOccludedFn<'a> = &'a dyn Fn(&Aabb) -> bool;

/// Spatial acceleration structure interface.
///
/// Mutations and `start_new_frame` need exclusive access; queries only read
/// and may run concurrently with each other.
pub trait SpatialSystem {
    /// Advance the frame counter and do the per-frame maintenance. Call once
    /// per frame, after last frame's mutations and before this frame's queries.
    fn start_new_frame(&mut self);

    fn frame_counter(&self) -> u64;

    /// Track an object with the given bounds. A zero category bitmask yields
    /// [`SpatialDataHandle::INVALID`].
    fn create_spatial_data(
        &mut self,
        bounds: &BoundingBoxSphere,
        object: EntityId,
        category_bitmask: u32,
        tags: &TagSet,
    ) -> SpatialDataHandle;

    /// Track an object that every visibility query returns regardless of position.
    fn create_spatial_data_always_visible(
        &mut self,
        object: EntityId,
        category_bitmask: u32,
        tags: &TagSet,
    ) -> SpatialDataHandle;

    fn delete_spatial_data(&mut self, handle: SpatialDataHandle) -> Result<(), SpatialError>;

    fn update_spatial_data_bounds(
        &mut self,
        handle: SpatialDataHandle,
        bounds: &BoundingBoxSphere,
    ) -> Result<(), SpatialError>;

    fn update_spatial_data_object(
        &mut self,
        handle: SpatialDataHandle,
        object: EntityId,
    ) -> Result<(), SpatialError>;

    fn find_objects_in_sphere(
        &self,
        sphere: &Sphere,
        params: &QueryParams<'_>,
        callback: QueryCallback<'_>,
    ) -> QueryStats;

    fn find_objects_in_box(
        &self,
        aabb: &Aabb,
        params: &QueryParams<'_>,
        callback: QueryCallback<'_>,
    ) -> QueryStats;

    /// Append every object inside the frustum (and every always-visible
    /// object) to `out`, stamping them visible with `vis_type`.
    fn find_visible_objects(
        &self,
        frustum: &Frustum,
        params: &QueryParams<'_>,
        out: &mut Vec<EntityId>,
        is_occluded: Option<IsOccludedFn<'_>>,
        vis_type: VisibilityState,
    ) -> Result<QueryStats, SpatialError>;

    fn get_visibility_state(
        &self,
        handle: SpatialDataHandle,
        num_frames_before_invisible: u32,
    ) -> Result<VisibilityState, SpatialError>;
}
