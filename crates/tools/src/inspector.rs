use glam::Vec3;
use gridspace_common::{Aabb, TagRegistry};
use gridspace_spatial::{
    Category, RegularGridSpatialSystem, SpatialDataHandle, SpatialError, SpatialSystem, VisibilityState,
};
use serde::Serialize;

/// Spatial system inspector for developer tooling.
///
/// Read-only views over a [`RegularGridSpatialSystem`] for debugging,
/// profiling and the CLI.
pub struct SpatialInspector;

impl SpatialInspector {
    pub fn summary(system: &RegularGridSpatialSystem) -> SpatialSummary {
        let stats = system.internal_stats();
        SpatialSummary {
            frame: stats.frame_counter,
            spatial_data: stats.num_spatial_data,
            regular_grids: stats.grids.iter().filter(|g| !g.cached).count(),
            cache_grids: stats.grids.iter().filter(|g| g.cached).count(),
            candidates: stats.candidates.len(),
            cells: stats.grids.iter().map(|g| g.num_cells).sum(),
        }
    }

    /// One line per grid, with category and tag names resolved.
    pub fn grid_lines(system: &RegularGridSpatialSystem, tags: &TagRegistry) -> Vec<GridLine> {
        system
            .internal_stats()
            .grids
            .into_iter()
            .map(|g| GridLine {
                grid_index: g.grid_index,
                cached: g.cached,
                category: g
                    .category_name
                    .unwrap_or_else(|| format!("#{}", g.category.index())),
                include: tags.describe(&g.include_tags),
                exclude: tags.describe(&g.exclude_tags),
                entries: g.num_entries,
                cells: g.num_cells,
                ready: g.migration_progress >= 1.0,
            })
            .collect()
    }

    /// Where a piece of data is stored and how visible it currently is.
    pub fn inspect_data(
        system: &RegularGridSpatialSystem,
        handle: SpatialDataHandle,
        num_frames_before_invisible: u32,
    ) -> Result<DataInfo, SpatialError> {
        let membership = system.grid_membership(handle)?;
        Ok(DataInfo {
            handle,
            grids: (0..64).filter(|i| membership & (1u64 << i) != 0).collect(),
            cell_box: system.cell_box_for_spatial_data(handle)?,
            visibility: system.get_visibility_state(handle, num_frames_before_invisible)?,
        })
    }

    pub fn cell_boxes(system: &RegularGridSpatialSystem, category: Option<Category>) -> CellBoxDump {
        let boxes = system.all_cell_boxes(category);
        // The overflow cell spans the whole addressable range and would swamp the extent.
        let cell_limit = system.config().cell_size as f32 * 4.0;
        let corners: Vec<Vec3> = boxes
            .iter()
            .filter(|b| (b.max - b.min).max_element() <= cell_limit)
            .flat_map(|b| [b.min, b.max])
            .collect();
        CellBoxDump {
            extent: Aabb::from_points(&corners),
            boxes,
        }
    }
}

/// Summary of the spatial system for the inspector.
#[derive(Debug, Clone, Serialize)]
pub struct SpatialSummary {
    pub frame: u64,
    pub spatial_data: usize,
    pub regular_grids: usize,
    pub cache_grids: usize,
    pub candidates: usize,
    pub cells: usize,
}

impl std::fmt::Display for SpatialSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Spatial: frame={} data={} grids={} cache_grids={} candidates={} cells={}",
            self.frame, self.spatial_data, self.regular_grids, self.cache_grids, self.candidates, self.cells
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GridLine {
    pub grid_index: usize,
    pub cached: bool,
    pub category: String,
    pub include: String,
    pub exclude: String,
    pub entries: usize,
    pub cells: usize,
    /// False while a cache grid is still migrating.
    pub ready: bool,
}

impl std::fmt::Display for GridLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cached {
            write!(
                f,
                "cache #{} {} include={} exclude={} entries={} cells={}{}",
                self.grid_index,
                self.category,
                self.include,
                self.exclude,
                self.entries,
                self.cells,
                if self.ready { "" } else { " (migrating)" }
            )
        } else {
            write!(
                f,
                "grid #{} {} entries={} cells={}",
                self.grid_index, self.category, self.entries, self.cells
            )
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DataInfo {
    pub handle: SpatialDataHandle,
    pub grids: Vec<usize>,
    pub cell_box: Aabb,
    pub visibility: VisibilityState,
}

impl std::fmt::Display for DataInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (min, max) = (self.cell_box.min, self.cell_box.max);
        write!(
            f,
            "Data [{}:{}] grids={:?} cell=({:.1}, {:.1}, {:.1})..({:.1}, {:.1}, {:.1}) {:?}",
            self.handle.index(),
            self.handle.generation(),
            self.grids,
            min.x,
            min.y,
            min.z,
            max.x,
            max.y,
            max.z,
            self.visibility,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellBoxDump {
    pub boxes: Vec<Aabb>,
    /// Extent of the regular cells; `None` if there are none.
    pub extent: Option<Aabb>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_common::{BoundingBoxSphere, EntityId, Sphere, TagSet};
    use gridspace_spatial::{CategoryFlags, QueryParams, VisitorExecution};

    fn spawn(system: &mut RegularGridSpatialSystem, at: Vec3, tags: &TagSet) -> SpatialDataHandle {
        let bounds = BoundingBoxSphere::from_sphere(&Sphere::new(at, 1.0));
        system.create_spatial_data(&bounds, EntityId::new(), 1, tags)
    }

    #[test]
    fn summary_empty_system() {
        let system = RegularGridSpatialSystem::default();
        let summary = SpatialInspector::summary(&system);
        assert_eq!(summary.frame, 0);
        assert_eq!(summary.spatial_data, 0);
        assert_eq!(summary.regular_grids, 0);
    }

    #[test]
    fn summary_with_data() {
        let mut system = RegularGridSpatialSystem::default();
        spawn(&mut system, Vec3::ZERO, &TagSet::new());
        spawn(&mut system, Vec3::new(500.0, 0.0, 0.0), &TagSet::new());
        system.start_new_frame();

        let summary = SpatialInspector::summary(&system);
        assert_eq!(summary.frame, 1);
        assert_eq!(summary.spatial_data, 2);
        assert_eq!(summary.regular_grids, 1);
        assert_eq!(summary.cells, 2);
        assert!(format!("{summary}").contains("data=2"));
    }

    #[test]
    fn grid_lines_use_names() {
        let mut tags = TagRegistry::new();
        let foliage = tags.register("Foliage");
        let foliage_set: TagSet = [foliage].into_iter().collect();

        let mut system = RegularGridSpatialSystem::default();
        system.register_category("Static", CategoryFlags::NONE).unwrap();
        for i in 0..400 {
            let t = if i % 2 == 0 { foliage_set.clone() } else { TagSet::new() };
            spawn(&mut system, Vec3::new((i % 20) as f32 * 30.0, 0.0, (i / 20) as f32 * 30.0), &t);
        }
        let everything = Aabb::new(Vec3::splat(-50.0), Vec3::splat(1000.0));
        for _ in 0..20 {
            let params = QueryParams::new(1).with_include_tags(&foliage_set);
            system.find_objects_in_box(&everything, &params, &mut |_: EntityId| VisitorExecution::Continue);
            system.start_new_frame();
        }

        let lines = SpatialInspector::grid_lines(&system, &tags);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].category, "Static");
        let cache = &lines[1];
        assert!(cache.cached);
        assert!(cache.ready);
        assert_eq!(cache.include, "{ Foliage }");
        assert_eq!(cache.entries, 200);
        assert!(cache.to_string().starts_with("cache #62 Static"));
    }

    #[test]
    fn inspect_data_reports_location() {
        let mut system = RegularGridSpatialSystem::default();
        let h = spawn(&mut system, Vec3::new(10.0, 10.0, 10.0), &TagSet::new());

        let info = SpatialInspector::inspect_data(&system, h, 2).unwrap();
        assert_eq!(info.grids, vec![0]);
        assert!(info.cell_box.contains_point(Vec3::new(10.0, 10.0, 10.0)));
        assert_eq!(info.visibility, VisibilityState::Invisible);
        assert!(info.to_string().contains("grids=[0]"));
    }

    #[test]
    fn inspect_data_not_found() {
        let mut system = RegularGridSpatialSystem::default();
        let h = spawn(&mut system, Vec3::ZERO, &TagSet::new());
        system.delete_spatial_data(h).unwrap();
        assert!(SpatialInspector::inspect_data(&system, h, 2).is_err());
    }

    #[test]
    fn cell_box_extent_skips_overflow_cell() {
        let mut system = RegularGridSpatialSystem::default();
        spawn(&mut system, Vec3::splat(10.0), &TagSet::new());
        spawn(&mut system, Vec3::new(300.0, 10.0, 10.0), &TagSet::new());

        let dump = SpatialInspector::cell_boxes(&system, None);
        assert_eq!(dump.boxes.len(), 3);
        let extent = dump.extent.unwrap();
        assert_eq!(extent.min, Vec3::splat(-32.0));
        assert_eq!(extent.max, Vec3::new(416.0, 160.0, 160.0));

        let empty = SpatialInspector::cell_boxes(&RegularGridSpatialSystem::default(), None);
        assert!(empty.boxes.is_empty());
        assert!(empty.extent.is_none());
    }
}
