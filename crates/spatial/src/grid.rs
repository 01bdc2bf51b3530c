use glam::{IVec3, Vec3};
use gridspace_common::{Aabb, BoundingBoxSphere, EntityId, TagSet};
use std::collections::HashMap;

use crate::category::Category;
use crate::cell::{Cell, CellEntry};
use crate::config::SpatialConfig;
use crate::query::{QueryParams, VisitorExecution, filter_by_tags, tag_sets_equal};

/// Largest cell coordinate (per axis) that fits into a cell key.
const MAX_CELL_INDEX: i32 = (1 << 20) - 1;
const CELL_INDEX_MASK: u64 = (1 << 21) - 1;

/// Cell 0 of every grid holds entries that do not fit into a regular cell.
pub(crate) const OVERFLOW_CELL: u32 = 0;
/// Pseudo cell index for the always-visible list.
pub(crate) const ALWAYS_VISIBLE_CELL: u32 = u32::MAX - 1;
const NO_CELL: u32 = u32::MAX;

/// Pack a cell coordinate into 3 x 21 bits.
pub(crate) fn cell_key(coord: IVec3) -> u64 {
    let pack = |v: i32| ((v + MAX_CELL_INDEX) as u64) & CELL_INDEX_MASK;
    (pack(coord.x) << 42) | (pack(coord.y) << 21) | pack(coord.z)
}

/// Cell size and overlap margin shared by all grids of one system.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GridGeometry {
    pub cell_size: f32,
    pub inv_cell_size: f32,
    pub overlap_size: f32,
}

impl GridGeometry {
    pub fn from_config(config: &SpatialConfig) -> Self {
        let cell_size = config.cell_size as f32;
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            overlap_size: config.overlap_size(),
        }
    }

    /// Cell containing `p`, or `None` outside the addressable range.
    pub fn cell_coord(&self, p: Vec3) -> Option<IVec3> {
        let c = (p * self.inv_cell_size).floor();
        let limit = MAX_CELL_INDEX as f32;
        if c.abs().cmpge(Vec3::splat(limit)).any() || !c.is_finite() {
            return None;
        }
        Some(c.as_ivec3())
    }

    /// Cell extents inflated by the overlap margin.
    pub fn cell_box(&self, coord: IVec3) -> Aabb {
        let min = coord.as_vec3() * self.cell_size;
        Aabb::new(
            min - Vec3::splat(self.overlap_size),
            min + Vec3::splat(self.cell_size + self.overlap_size),
        )
    }

    /// Box of the overflow cell: the whole addressable range.
    pub fn overflow_box(&self) -> Aabb {
        Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(self.cell_size * MAX_CELL_INDEX as f32))
    }

    /// Inclusive range of cell coordinates a query box can touch.
    fn cell_range(&self, query: &Aabb) -> (IVec3, IVec3) {
        let clamp = |v: Vec3| {
            (v * self.inv_cell_size)
                .floor()
                .clamp(Vec3::splat(-(MAX_CELL_INDEX as f32)), Vec3::splat(MAX_CELL_INDEX as f32))
                .as_ivec3()
        };
        let margin = Vec3::splat(self.overlap_size);
        (clamp(query.min - margin), clamp(query.max + margin))
    }
}

/// Where a piece of data lives inside a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellDataMapping {
    pub cell: u32,
    pub slot: u32,
}

impl CellDataMapping {
    const NONE: Self = Self {
        cell: NO_CELL,
        slot: NO_CELL,
    };

    fn is_none(&self) -> bool {
        self.cell == NO_CELL
    }
}

/// Tag filter of a cache grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TagFilter {
    pub include: TagSet,
    pub exclude: TagSet,
}

enum Placement {
    Cell(u64, IVec3),
    Overflow,
}

/// Sparse uniform grid over one category, optionally restricted to a tag filter.
#[derive(Debug)]
pub(crate) struct Grid {
    pub category: Category,
    pub can_be_cached: bool,
    /// `Some` for cache grids.
    pub filter: Option<TagFilter>,
    geometry: GridGeometry,
    cells: Vec<Cell>,
    cell_keys: HashMap<u64, u32>,
    always_visible: Cell,
    mappings: Vec<CellDataMapping>,
    /// Next source data index to migrate; `None` once the grid is complete.
    migration_cursor: Option<u32>,
}

impl Grid {
    pub fn new_regular(category: Category, geometry: GridGeometry, can_be_cached: bool) -> Self {
        Self {
            category,
            can_be_cached,
            filter: None,
            geometry,
            cells: vec![Cell::new(geometry.overflow_box(), None)],
            cell_keys: HashMap::new(),
            always_visible: Cell::new(geometry.overflow_box(), None),
            mappings: Vec::new(),
            migration_cursor: None,
        }
    }

    pub fn new_cached(category: Category, geometry: GridGeometry, include: TagSet, exclude: TagSet) -> Self {
        Self {
            filter: Some(TagFilter { include, exclude }),
            migration_cursor: Some(0),
            ..Self::new_regular(category, geometry, true)
        }
    }

    pub fn is_cached(&self) -> bool {
        self.filter.is_some()
    }

    /// A cache grid may only answer queries once every source entry was copied.
    pub fn caching_completed(&self) -> bool {
        self.migration_cursor.is_none()
    }

    pub fn migration_cursor(&self) -> Option<u32> {
        self.migration_cursor
    }

    /// True if data with these categories and tags belongs in this grid.
    pub fn accepts(&self, category_bitmask: u32, tags: &TagSet) -> bool {
        if self.category.bitmask() & category_bitmask == 0 {
            return false;
        }
        match &self.filter {
            Some(f) => !filter_by_tags(tags, Some(&f.include), Some(&f.exclude)),
            None => true,
        }
    }

    /// True if this is a cache grid for exactly the query's tags.
    pub fn serves_query(&self, params: &QueryParams<'_>) -> bool {
        match &self.filter {
            Some(f) => {
                self.category.bitmask() & params.category_bitmask != 0
                    && tag_sets_equal(&f.include, params.include_tags)
                    && tag_sets_equal(&f.exclude, params.exclude_tags)
            }
            None => false,
        }
    }

    pub fn contains_data(&self, data_index: u32) -> bool {
        self.mapping(data_index).is_some()
    }

    fn mapping(&self, data_index: u32) -> Option<CellDataMapping> {
        self.mappings
            .get(data_index as usize)
            .copied()
            .filter(|m| !m.is_none())
    }

    fn set_mapping(&mut self, data_index: u32, mapping: CellDataMapping) {
        let i = data_index as usize;
        if self.mappings.len() <= i {
            self.mappings.resize(i + 1, CellDataMapping::NONE);
        }
        self.mappings[i] = mapping;
    }

    fn cell(&self, index: u32) -> &Cell {
        if index == ALWAYS_VISIBLE_CELL {
            &self.always_visible
        } else {
            &self.cells[index as usize]
        }
    }

    fn cell_mut(&mut self, index: u32) -> &mut Cell {
        if index == ALWAYS_VISIBLE_CELL {
            &mut self.always_visible
        } else {
            &mut self.cells[index as usize]
        }
    }

    fn placement(&self, bounds: &BoundingBoxSphere) -> Placement {
        let Some(coord) = self.geometry.cell_coord(bounds.center) else {
            return Placement::Overflow;
        };
        if self.geometry.cell_box(coord).contains(&bounds.aabb()) {
            Placement::Cell(cell_key(coord), coord)
        } else {
            Placement::Overflow
        }
    }

    fn get_or_create_cell(&mut self, placement: Placement) -> u32 {
        match placement {
            Placement::Overflow => OVERFLOW_CELL,
            Placement::Cell(key, coord) => {
                if let Some(&index) = self.cell_keys.get(&key) {
                    return index;
                }
                let index = self.cells.len() as u32;
                self.cells
                    .push(Cell::new(self.geometry.cell_box(coord), Some(key)));
                self.cell_keys.insert(key, index);
                index
            }
        }
    }

    /// Insert into the cell containing the entry's center. Returns the cell index.
    pub fn add(&mut self, data_index: u32, entry: CellEntry) -> u32 {
        debug_assert!(!self.contains_data(data_index), "data already in grid");
        let placement = self.placement(&entry.bounds);
        let cell = self.get_or_create_cell(placement);
        let slot = self.cells[cell as usize].add(entry, data_index);
        self.set_mapping(data_index, CellDataMapping { cell, slot });
        cell
    }

    pub fn add_always_visible(&mut self, data_index: u32, entry: CellEntry) {
        debug_assert!(!self.contains_data(data_index), "data already in grid");
        let slot = self.always_visible.add(entry, data_index);
        self.set_mapping(
            data_index,
            CellDataMapping {
                cell: ALWAYS_VISIBLE_CELL,
                slot,
            },
        );
    }

    /// Remove the data and return what was stored for it.
    pub fn remove(&mut self, data_index: u32) -> Option<CellEntry> {
        let mapping = self.mapping(data_index)?;
        let (entry, moved) = self.cell_mut(mapping.cell).remove(mapping.slot);
        if let Some(moved) = moved {
            self.mappings[moved as usize].slot = mapping.slot;
        }
        self.mappings[data_index as usize] = CellDataMapping::NONE;

        if mapping.cell != OVERFLOW_CELL
            && mapping.cell != ALWAYS_VISIBLE_CELL
            && self.cells[mapping.cell as usize].is_empty()
        {
            self.remove_empty_cell(mapping.cell);
        }
        Some(entry)
    }

    fn remove_empty_cell(&mut self, index: u32) {
        let removed = self.cells.swap_remove(index as usize);
        if let Some(key) = removed.key {
            self.cell_keys.remove(&key);
        }
        let Some(moved) = self.cells.get(index as usize) else {
            return;
        };
        if let Some(key) = moved.key {
            self.cell_keys.insert(key, index);
        }
        for &d in &moved.data_indices {
            self.mappings[d as usize].cell = index;
        }
    }

    /// Move or update the data's bounds. Always-visible data is left untouched.
    pub fn update_bounds(&mut self, data_index: u32, bounds: &BoundingBoxSphere) -> bool {
        let Some(mapping) = self.mapping(data_index) else {
            return false;
        };
        if mapping.cell == ALWAYS_VISIBLE_CELL {
            return true;
        }

        let placement = self.placement(bounds);
        let same_cell = match &placement {
            Placement::Overflow => mapping.cell == OVERFLOW_CELL,
            Placement::Cell(key, _) => self.cells[mapping.cell as usize].key == Some(*key),
        };

        if same_cell {
            self.cells[mapping.cell as usize].set_bounds(mapping.slot, bounds);
        } else if let Some(mut entry) = self.remove(data_index) {
            entry.bounds = *bounds;
            self.add(data_index, entry);
        }
        true
    }

    pub fn set_object(&mut self, data_index: u32, object: EntityId) -> bool {
        let Some(mapping) = self.mapping(data_index) else {
            return false;
        };
        self.cell_mut(mapping.cell).objects[mapping.slot as usize] = object;
        true
    }

    pub fn last_visible(&self, data_index: u32) -> Option<u64> {
        let mapping = self.mapping(data_index)?;
        Some(self.cell(mapping.cell).last_visible(mapping.slot))
    }

    /// Inflated box of the cell holding the data.
    pub fn cell_box_of(&self, data_index: u32) -> Option<Aabb> {
        let mapping = self.mapping(data_index)?;
        Some(self.cell(mapping.cell).bounds)
    }

    /// Visit every cell that may hold entries overlapping `query`, then the
    /// overflow cell. Stops early when the visitor says so.
    pub fn for_each_cell_in_box<F>(&self, query: &Aabb, mut visit: F) -> VisitorExecution
    where
        F: FnMut(&Cell) -> VisitorExecution,
    {
        let (min, max) = self.geometry.cell_range(query);
        let extent = (max - min + IVec3::ONE).as_i64vec3();
        let num_coords = extent.x * extent.y * extent.z;

        if num_coords > self.cells.len() as i64 {
            // Query spans more coordinates than there are cells: scan the cells instead.
            for cell in self.cells.iter().skip(1) {
                if cell.bounds.overlaps(query) && visit(cell) == VisitorExecution::Stop {
                    return VisitorExecution::Stop;
                }
            }
        } else {
            for z in min.z..=max.z {
                for y in min.y..=max.y {
                    for x in min.x..=max.x {
                        let key = cell_key(IVec3::new(x, y, z));
                        if let Some(&index) = self.cell_keys.get(&key) {
                            if visit(&self.cells[index as usize]) == VisitorExecution::Stop {
                                return VisitorExecution::Stop;
                            }
                        }
                    }
                }
            }
        }

        visit(&self.cells[OVERFLOW_CELL as usize])
    }

    pub fn always_visible_cell(&self) -> &Cell {
        &self.always_visible
    }

    /// Regular cells followed by the overflow cell.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    /// Number of non-empty regular cells.
    pub fn num_cells(&self) -> usize {
        self.cells.len() - 1
    }

    pub fn num_entries(&self) -> usize {
        self.cells.iter().map(Cell::len).sum::<usize>() + self.always_visible.len()
    }

    /// Data indices of every entry in this grid.
    pub fn data_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.cells
            .iter()
            .chain(std::iter::once(&self.always_visible))
            .flat_map(|c| c.data_indices.iter().copied())
    }

    /// Copy the next batch of matching entries from `source`. Returns the data
    /// indices that were added; the caller records the membership.
    pub fn migrate_batch(&mut self, source: &Grid, batch_size: u32) -> Vec<u32> {
        let Some(start) = self.migration_cursor else {
            return Vec::new();
        };
        let source_count = source.mappings.len() as u32;
        let end = start.saturating_add(batch_size).min(source_count);

        let migrated = (start..end)
            .filter(|&i| self.migrate_from(i, source))
            .collect();

        self.migration_cursor = (end < source_count).then_some(end);
        migrated
    }

    /// Share of `source` already walked by the migration, in `[0, 1]`.
    pub fn migration_progress(&self, source: Option<&Grid>) -> f32 {
        let Some(cursor) = self.migration_cursor else {
            return 1.0;
        };
        match source.map(|s| s.mappings.len()) {
            Some(len) if len > 0 => (cursor as f32 / len as f32).min(1.0),
            _ => 0.0,
        }
    }

    fn migrate_from(&mut self, data_index: u32, source: &Grid) -> bool {
        if self.contains_data(data_index) {
            return false;
        }
        let Some(mapping) = source.mapping(data_index) else {
            return false;
        };
        let entry = source.cell(mapping.cell).entry(mapping.slot);
        if !self.accepts(entry.category_bitmask, &entry.tags) {
            return false;
        }
        if mapping.cell == ALWAYS_VISIBLE_CELL {
            self.add_always_visible(data_index, entry);
        } else {
            self.add(data_index, entry);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_common::{Sphere, Tag};

    fn geometry() -> GridGeometry {
        GridGeometry::from_config(&SpatialConfig::default())
    }

    fn entry(center: Vec3, radius: f32, tags: TagSet) -> CellEntry {
        CellEntry {
            bounds: BoundingBoxSphere::from_sphere(&Sphere::new(center, radius)),
            tags,
            object: EntityId::from_u128(center.x.to_bits() as u128),
            category_bitmask: 1,
            last_visible: 0,
        }
    }

    fn collect_cells(grid: &Grid, query: &Aabb) -> usize {
        let mut n = 0;
        grid.for_each_cell_in_box(query, |_| {
            n += 1;
            VisitorExecution::Continue
        });
        n
    }

    #[test]
    fn cell_key_is_unique_per_coordinate() {
        let a = cell_key(IVec3::new(0, 0, 0));
        let b = cell_key(IVec3::new(1, 0, 0));
        let c = cell_key(IVec3::new(0, 0, 1));
        let d = cell_key(IVec3::new(-1, 0, 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(b, d);
    }

    #[test]
    fn geometry_cell_coords_floor() {
        let g = geometry();
        assert_eq!(g.cell_coord(Vec3::new(10.0, 0.0, 130.0)), Some(IVec3::new(0, 0, 1)));
        assert_eq!(g.cell_coord(Vec3::new(-1.0, 0.0, 0.0)), Some(IVec3::new(-1, 0, 0)));
        assert_eq!(g.cell_coord(Vec3::splat(f32::INFINITY)), None);

        let b = g.cell_box(IVec3::new(1, 0, 0));
        assert_eq!(b.min, Vec3::new(96.0, -32.0, -32.0));
        assert_eq!(b.max, Vec3::new(288.0, 160.0, 160.0));
    }

    #[test]
    fn add_creates_cells_and_remove_deletes_them() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        let c0 = grid.add(0, entry(Vec3::ZERO, 1.0, TagSet::new()));
        let c1 = grid.add(1, entry(Vec3::new(300.0, 0.0, 0.0), 1.0, TagSet::new()));
        assert_ne!(c0, c1);
        assert_eq!(grid.num_cells(), 2);
        assert_eq!(grid.num_entries(), 2);

        assert!(grid.remove(0).is_some());
        assert_eq!(grid.num_cells(), 1);
        // The cell that was swapped into the freed position is still addressable.
        assert!(grid.cell_box_of(1).unwrap().contains_point(Vec3::new(300.0, 0.0, 0.0)));
        assert!(grid.remove(0).is_none());
        assert!(grid.remove(1).is_some());
        assert_eq!(grid.num_cells(), 0);
    }

    #[test]
    fn huge_objects_go_to_overflow_cell() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        let cell = grid.add(0, entry(Vec3::ZERO, 1000.0, TagSet::new()));
        assert_eq!(cell, OVERFLOW_CELL);
        assert_eq!(grid.num_cells(), 0);

        // Every box query visits the overflow cell.
        let far = Aabb::new(Vec3::splat(5000.0), Vec3::splat(5001.0));
        let mut seen = 0;
        grid.for_each_cell_in_box(&far, |cell| {
            seen += cell.len();
            VisitorExecution::Continue
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn update_bounds_moves_between_cells() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        grid.add(0, entry(Vec3::new(10.0, 10.0, 10.0), 1.0, TagSet::new()));
        let old_box = grid.cell_box_of(0).unwrap();

        // Same cell: updated in place.
        let nearby = BoundingBoxSphere::from_sphere(&Sphere::new(Vec3::new(20.0, 10.0, 10.0), 1.0));
        assert!(grid.update_bounds(0, &nearby));
        assert_eq!(grid.cell_box_of(0).unwrap(), old_box);

        // Crossing into the next cell moves the entry and drops the old cell.
        let moved = BoundingBoxSphere::from_sphere(&Sphere::new(Vec3::new(140.0, 10.0, 10.0), 1.0));
        assert!(grid.update_bounds(0, &moved));
        let new_box = grid.cell_box_of(0).unwrap();
        assert_ne!(new_box, old_box);
        assert!(new_box.contains_point(moved.center));
        assert_eq!(grid.num_cells(), 1);
    }

    #[test]
    fn update_preserves_object_and_tags() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        let tags: TagSet = [Tag(4)].into_iter().collect();
        let e = entry(Vec3::ZERO, 1.0, tags.clone());
        let object = e.object;
        grid.add(0, e);

        let moved = BoundingBoxSphere::from_sphere(&Sphere::new(Vec3::new(1000.0, 0.0, 0.0), 1.0));
        grid.update_bounds(0, &moved);
        let stored = grid.remove(0).unwrap();
        assert_eq!(stored.object, object);
        assert_eq!(stored.tags, tags);
        assert_eq!(stored.bounds, moved);
    }

    #[test]
    fn for_each_cell_only_visits_nearby_cells() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        for i in 0..10 {
            grid.add(i, entry(Vec3::new(i as f32 * 128.0 + 64.0, 0.0, 0.0), 1.0, TagSet::new()));
        }
        // Only the cell around x=64, plus the overflow cell.
        let query = Aabb::new(Vec3::new(60.0, -1.0, -1.0), Vec3::new(70.0, 1.0, 1.0));
        assert_eq!(collect_cells(&grid, &query), 2);

        // A query covering everything falls back to scanning the cell list.
        let everything = Aabb::new(Vec3::splat(-1.0e6), Vec3::splat(1.0e6));
        assert_eq!(collect_cells(&grid, &everything), 11);
    }

    #[test]
    fn visitor_can_stop_early() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        grid.add(0, entry(Vec3::ZERO, 1.0, TagSet::new()));
        grid.add(1, entry(Vec3::new(130.0, 0.0, 0.0), 1.0, TagSet::new()));
        let query = Aabb::new(Vec3::splat(-500.0), Vec3::splat(500.0));
        let mut visits = 0;
        let result = grid.for_each_cell_in_box(&query, |_| {
            visits += 1;
            VisitorExecution::Stop
        });
        assert_eq!(result, VisitorExecution::Stop);
        assert_eq!(visits, 1);
    }

    #[test]
    fn always_visible_entries_live_outside_cells() {
        let mut grid = Grid::new_regular(Category(0), geometry(), true);
        grid.add_always_visible(3, entry(Vec3::ZERO, 0.0, TagSet::new()));
        assert_eq!(grid.always_visible_cell().len(), 1);
        assert_eq!(grid.num_cells(), 0);
        assert!(grid.contains_data(3));
        // Bounds updates are ignored.
        let moved = BoundingBoxSphere::from_sphere(&Sphere::new(Vec3::splat(500.0), 1.0));
        assert!(grid.update_bounds(3, &moved));
        assert_eq!(grid.num_cells(), 0);
        assert!(grid.remove(3).is_some());
        assert!(grid.always_visible_cell().is_empty());
    }

    #[test]
    fn cached_grid_migrates_matching_entries_in_batches() {
        let foliage = Tag(1);
        let foliage_set: TagSet = [foliage].into_iter().collect();

        let mut source = Grid::new_regular(Category(0), geometry(), true);
        for i in 0..10u32 {
            let tags = if i % 2 == 0 { foliage_set.clone() } else { TagSet::new() };
            source.add(i, entry(Vec3::new(i as f32, 0.0, 0.0), 1.0, tags));
        }

        let mut cached = Grid::new_cached(Category(0), geometry(), foliage_set.clone(), TagSet::new());
        assert!(!cached.caching_completed());

        assert_eq!(cached.migration_progress(Some(&source)), 0.0);
        let first = cached.migrate_batch(&source, 4);
        assert_eq!(first, vec![0, 2]);
        assert_eq!(cached.migration_cursor(), Some(4));
        assert_eq!(cached.migration_progress(Some(&source)), 0.4);

        let rest = cached.migrate_batch(&source, 100);
        assert_eq!(rest, vec![4, 6, 8]);
        assert!(cached.caching_completed());
        assert_eq!(cached.num_entries(), 5);
        assert_eq!(cached.migration_progress(Some(&source)), 1.0);
        assert!(cached.migrate_batch(&source, 100).is_empty());
    }

    #[test]
    fn serves_only_exact_tag_filters() {
        let a: TagSet = [Tag(1)].into_iter().collect();
        let b: TagSet = [Tag(2)].into_iter().collect();
        let grid = Grid::new_cached(Category(2), geometry(), a.clone(), TagSet::new());

        assert!(grid.serves_query(&QueryParams::new(0b100).with_include_tags(&a)));
        assert!(!grid.serves_query(&QueryParams::new(0b100).with_include_tags(&b)));
        assert!(!grid.serves_query(&QueryParams::new(0b001).with_include_tags(&a)));
        assert!(!grid.serves_query(
            &QueryParams::new(0b100)
                .with_include_tags(&a)
                .with_exclude_tags(&b)
        ));

        assert!(grid.accepts(0b100, &a));
        assert!(!grid.accepts(0b100, &b));
        assert!(!grid.accepts(0b010, &a));
    }
}
