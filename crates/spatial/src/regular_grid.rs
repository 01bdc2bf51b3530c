use glam::Vec3;
use gridspace_common::{Aabb, BoundingBoxSphere, EntityId, Frustum, Sphere, TagSet};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use crate::cache::{CacheCandidates, CandidateStats};
use crate::category::{Category, CategoryFlags, CategoryRegistry};
use crate::cell::{Cell, CellEntry};
use crate::config::SpatialConfig;
use crate::data::{GridBits, MAX_NUM_GRIDS, MAX_NUM_REGULAR_GRIDS, SpatialData};
use crate::error::SpatialError;
use crate::grid::{Grid, GridGeometry};
use crate::id_table::{IdTable, SpatialDataHandle};
use crate::query::{GridWalkStats, QueryParams, QueryStats, VisibilityState, VisitorExecution};
use crate::system::{IsOccludedFn, QueryCallback, SpatialSystem};

/// Shape a sphere or box query is run with.
trait QueryShape {
    fn bounding_box(&self) -> Aabb;
    fn overlaps_cell(&self, cell: &Aabb) -> bool;
    fn overlaps_entry(&self, sphere: &Sphere) -> bool;
}

impl QueryShape for Sphere {
    fn bounding_box(&self) -> Aabb {
        Sphere::bounding_box(self)
    }

    fn overlaps_cell(&self, cell: &Aabb) -> bool {
        cell.overlaps_sphere(self)
    }

    fn overlaps_entry(&self, sphere: &Sphere) -> bool {
        self.overlaps(sphere)
    }
}

impl QueryShape for Aabb {
    fn bounding_box(&self) -> Aabb {
        *self
    }

    fn overlaps_cell(&self, cell: &Aabb) -> bool {
        self.overlaps(cell)
    }

    fn overlaps_entry(&self, sphere: &Sphere) -> bool {
        self.overlaps_sphere(sphere)
    }
}

/// How entries of the grid being walked are filtered.
#[derive(Clone, Copy)]
struct WalkFilter<'a> {
    params: &'a QueryParams<'a>,
    /// Tags must be tested per entry (false for cache grids).
    test_tags: bool,
    /// Categories of grids already walked by this query. Entries in any of
    /// them were reported there and are skipped.
    covered: u32,
    /// The cell being visited is the always-visible list.
    always_visible: bool,
}

impl WalkFilter<'_> {
    /// Classify entry `i`: `None` if it was already reported, otherwise
    /// whether it passes the tag filter. Rejections are counted here; the
    /// caller counts `passed` once the entry is reported.
    fn check(&self, cell: &Cell, i: usize, stats: &mut GridWalkStats) -> Option<bool> {
        if cell.categories[i] & self.covered != 0 {
            return None;
        }
        if self.test_tags && self.params.rejects(&cell.tags[i]) {
            stats.filtered += 1;
            return Some(false);
        }
        Some(true)
    }
}

type CellVisitor<'v> = dyn FnMut(&Cell, &WalkFilter<'_>, &mut GridWalkStats) -> VisitorExecution + 'v;

/// Sparse regular grids, one per category, plus up to 31 cache grids holding
/// the subset of a category that matches a frequently used tag filter.
///
/// Mutations need `&mut self`. Queries take `&self` and can run from several
/// threads at once; they only write visibility stamps (atomics) and cache
/// statistics (behind a mutex).
#[derive(Debug)]
pub struct RegularGridSpatialSystem {
    config: SpatialConfig,
    geometry: GridGeometry,
    categories: CategoryRegistry,
    /// Indices `0..32` are regular grids, `32..63` cache grids.
    grids: Vec<Option<Box<Grid>>>,
    data: IdTable<SpatialData>,
    candidates: CacheCandidates,
    frame_counter: u64,
    exhaustion_reported: bool,
}

impl Default for RegularGridSpatialSystem {
    fn default() -> Self {
        Self::new(SpatialConfig::default())
    }
}

impl RegularGridSpatialSystem {
    /// Panics on an invalid config; use [`Self::try_new`] for untrusted input.
    pub fn new(config: SpatialConfig) -> Self {
        assert!(config.validate().is_ok(), "invalid spatial config: {config:?}");
        Self {
            geometry: GridGeometry::from_config(&config),
            config,
            categories: CategoryRegistry::new(),
            grids: (0..MAX_NUM_GRIDS).map(|_| None).collect(),
            data: IdTable::new(),
            candidates: CacheCandidates::new(),
            frame_counter: 0,
            exhaustion_reported: false,
        }
    }

    pub fn try_new(config: SpatialConfig) -> Result<Self, SpatialError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.config
    }

    pub fn categories(&self) -> &CategoryRegistry {
        &self.categories
    }

    pub fn register_category(&mut self, name: &str, flags: CategoryFlags) -> Result<Category, SpatialError> {
        let category = self.categories.register(name, flags)?;
        if let Some(grid) = self.grids[category.grid_index()].as_deref_mut() {
            grid.can_be_cached = !self.categories.flags(category).frequent_changes;
        }
        Ok(category)
    }

    /// Change the minimum query size for caching. Existing cache grids were
    /// chosen under the old threshold and are dropped.
    pub fn set_caching_threshold(&mut self, threshold: u32) {
        self.config.cache.caching_threshold = threshold;
        self.remove_all_cached_grids();
    }

    pub fn num_spatial_data(&self) -> usize {
        self.data.len()
    }

    pub fn num_cached_grids(&self) -> usize {
        self.grids[MAX_NUM_REGULAR_GRIDS..].iter().flatten().count()
    }

    /// Grid membership bits of the data (bit `i` = grid `i`).
    pub fn grid_membership(&self, handle: SpatialDataHandle) -> Result<u64, SpatialError> {
        self.lookup(handle).map(|d| d.grid_bitmask())
    }

    /// Inflated box of the cell holding the data in its first grid.
    pub fn cell_box_for_spatial_data(&self, handle: SpatialDataHandle) -> Result<Aabb, SpatialError> {
        let data = self.lookup(handle)?;
        data.grids()
            .find_map(|gi| self.grids[gi].as_deref()?.cell_box_of(handle.index()))
            .ok_or(SpatialError::InvalidHandle(handle))
    }

    /// Boxes of every cell (overflow cells included). Without a filter the
    /// boxes of all grids are merged and duplicates dropped.
    pub fn all_cell_boxes(&self, filter: Option<Category>) -> Vec<Aabb> {
        if let Some(category) = filter {
            if category.grid_index() >= MAX_NUM_REGULAR_GRIDS {
                return Vec::new();
            }
            return self.grids[category.grid_index()]
                .as_deref()
                .map(|g| g.cells().map(|c| c.bounds).collect())
                .unwrap_or_default();
        }

        let mut seen = HashSet::new();
        let mut boxes = Vec::new();
        for grid in self.grids.iter().flatten() {
            for cell in grid.cells() {
                let b = cell.bounds;
                let key = [b.min.x, b.min.y, b.min.z, b.max.x, b.max.y, b.max.z].map(f32::to_bits);
                if seen.insert(key) {
                    boxes.push(b);
                }
            }
        }
        boxes
    }

    pub fn internal_stats(&self) -> InternalStats {
        let grids = self
            .grids
            .iter()
            .enumerate()
            .filter_map(|(index, g)| {
                let grid = g.as_deref()?;
                let (include_tags, exclude_tags) = grid
                    .filter
                    .as_ref()
                    .map(|f| (f.include.clone(), f.exclude.clone()))
                    .unwrap_or_default();
                Some(GridStats {
                    grid_index: index,
                    category: grid.category,
                    category_name: self.categories.name(grid.category).map(str::to_owned),
                    cached: grid.is_cached(),
                    can_be_cached: grid.can_be_cached,
                    include_tags,
                    exclude_tags,
                    num_cells: grid.num_cells(),
                    num_entries: grid.num_entries(),
                    num_always_visible: grid.always_visible_cell().len(),
                    migration_progress: grid
                        .migration_progress(self.grids[grid.category.grid_index()].as_deref()),
                })
            })
            .collect();

        InternalStats {
            frame_counter: self.frame_counter,
            num_spatial_data: self.data.len(),
            grids,
            candidates: self.candidates.snapshot(&self.config.cache),
        }
    }

    fn lookup(&self, handle: SpatialDataHandle) -> Result<SpatialData, SpatialError> {
        self.data.get(handle).copied().ok_or_else(|| invalid_handle(handle))
    }

    fn ensure_regular_grid(&mut self, index: usize) -> &mut Grid {
        let geometry = self.geometry;
        let category = Category(index as u16);
        let can_be_cached = !self.categories.flags(category).frequent_changes;
        self.grids[index].get_or_insert_with(|| {
            tracing::debug!(grid = index, can_be_cached, "created regular grid");
            Box::new(Grid::new_regular(category, geometry, can_be_cached))
        })
    }

    fn add_spatial_data(
        &mut self,
        bounds: Option<&BoundingBoxSphere>,
        object: EntityId,
        category_bitmask: u32,
        tags: &TagSet,
    ) -> SpatialDataHandle {
        if category_bitmask == 0 {
            tracing::warn!(%object, "spatial data without category ignored");
            return SpatialDataHandle::INVALID;
        }

        let mut grid_bitmask = category_bitmask as u64;
        for (index, grid) in self.grids.iter().enumerate().skip(MAX_NUM_REGULAR_GRIDS) {
            if grid.as_deref().is_some_and(|g| g.accepts(category_bitmask, tags)) {
                grid_bitmask |= 1 << index;
            }
        }

        let always_visible = bounds.is_none();
        let handle = self.data.insert(SpatialData::new(grid_bitmask, always_visible));
        let entry = CellEntry {
            bounds: bounds
                .copied()
                .unwrap_or_else(|| BoundingBoxSphere::new(Vec3::ZERO, Vec3::ZERO, 0.0)),
            tags: tags.clone(),
            object,
            category_bitmask,
            last_visible: 0,
        };

        for index in GridBits(grid_bitmask) {
            let grid = if index < MAX_NUM_REGULAR_GRIDS {
                self.ensure_regular_grid(index)
            } else {
                match self.grids[index].as_deref_mut() {
                    Some(g) => g,
                    None => continue,
                }
            };
            if always_visible {
                grid.add_always_visible(handle.index(), entry.clone());
            } else {
                grid.add(handle.index(), entry.clone());
            }
        }
        tracing::trace!(index = handle.index(), grid_bitmask, always_visible, "added spatial data");
        handle
    }

    fn remove_cached_grid(&mut self, index: usize) {
        let Some(grid) = self.grids[index].take() else {
            return;
        };
        for d in grid.data_indices() {
            if let Some(data) = self.data.get_by_index_mut(d) {
                data.clear_grid(index);
            }
        }
        tracing::debug!(grid = index, category = grid.category.0, "removed cache grid");
    }

    fn remove_all_cached_grids(&mut self) {
        for index in self.candidates.clear_grids() {
            self.remove_cached_grid(index);
        }
    }

    fn migrate_cached_grids(&mut self) {
        let batch = self.config.cache.migration_batch_size;
        let (regular, cached) = self.grids.split_at_mut(MAX_NUM_REGULAR_GRIDS);
        for (offset, slot) in cached.iter_mut().enumerate() {
            let Some(target) = slot.as_deref_mut() else {
                continue;
            };
            if target.caching_completed() {
                continue;
            }
            let Some(source) = regular[target.category.grid_index()].as_deref() else {
                continue;
            };

            let index = MAX_NUM_REGULAR_GRIDS + offset;
            for d in target.migrate_batch(source, batch) {
                if let Some(data) = self.data.get_by_index_mut(d) {
                    data.set_grid(index);
                }
            }
            if target.caching_completed() {
                tracing::debug!(grid = index, entries = target.num_entries(), "cache grid ready");
            }
        }
    }

    /// Walk the grids a query needs. Completed cache grids matching the
    /// query's tags answer for their category; regular grids cover the rest.
    fn walk_grids(
        &self,
        query_box: &Aabb,
        params: &QueryParams<'_>,
        with_always_visible: bool,
        stats: &mut QueryStats,
        visit: &mut CellVisitor<'_>,
    ) {
        stats.total_num_objects = self.data.len();
        let mut remaining = params.category_bitmask;
        let mut covered = 0u32;

        for grid in self.grids[MAX_NUM_REGULAR_GRIDS..].iter().flatten() {
            let category = grid.category.bitmask();
            if remaining & category == 0 || !grid.caching_completed() || !grid.serves_query(params) {
                continue;
            }
            remaining &= !category;

            let filter = WalkFilter {
                params,
                test_tags: false,
                covered,
                always_visible: false,
            };
            let mut walk = GridWalkStats::default();
            let flow = walk_grid(grid, query_box, filter, with_always_visible, &mut walk, visit);
            covered |= category;
            stats.accumulate(&walk);
            self.candidates.record_query(
                grid.category,
                params.include_tags,
                params.exclude_tags,
                0.0,
                &self.config.cache,
            );
            if flow == VisitorExecution::Stop {
                return;
            }
        }

        let test_tags = params.uses_tags();
        for index in GridBits(remaining as u64) {
            let Some(grid) = self.grids[index].as_deref() else {
                continue;
            };
            let filter = WalkFilter {
                params,
                test_tags,
                covered,
                always_visible: false,
            };
            let mut walk = GridWalkStats::default();
            let flow = walk_grid(grid, query_box, filter, with_always_visible, &mut walk, visit);
            covered |= grid.category.bitmask();
            stats.accumulate(&walk);

            if test_tags && grid.can_be_cached {
                let ratio = walk.filtered_ratio();
                let considered = walk.passed + walk.filtered;
                if considered > self.config.cache.caching_threshold as usize
                    && ratio > self.config.cache.min_filtered_ratio
                {
                    self.candidates.record_query(
                        grid.category,
                        params.include_tags,
                        params.exclude_tags,
                        ratio,
                        &self.config.cache,
                    );
                }
            }
            if flow == VisitorExecution::Stop {
                return;
            }
        }
    }

    fn find_objects_in_shape<S: QueryShape>(
        &self,
        shape: &S,
        params: &QueryParams<'_>,
        callback: QueryCallback<'_>,
    ) -> QueryStats {
        let start = Instant::now();
        let mut stats = QueryStats::default();

        self.walk_grids(&shape.bounding_box(), params, false, &mut stats, &mut |cell, filter, walk| {
            if !shape.overlaps_cell(&cell.bounds) {
                return VisitorExecution::Continue;
            }
            walk.tested += cell.len();
            for i in 0..cell.len() {
                if !shape.overlaps_entry(&cell.spheres[i]) {
                    continue;
                }
                if filter.check(cell, i, walk) != Some(true) {
                    continue;
                }
                walk.passed += 1;
                if callback(cell.objects[i]) == VisitorExecution::Stop {
                    return VisitorExecution::Stop;
                }
            }
            VisitorExecution::Continue
        });

        stats.time_taken = start.elapsed();
        stats
    }
}

fn invalid_handle(handle: SpatialDataHandle) -> SpatialError {
    tracing::debug!(index = handle.index(), generation = handle.generation(), "invalid spatial data handle");
    SpatialError::InvalidHandle(handle)
}

fn walk_grid(
    grid: &Grid,
    query_box: &Aabb,
    filter: WalkFilter<'_>,
    with_always_visible: bool,
    walk: &mut GridWalkStats,
    visit: &mut CellVisitor<'_>,
) -> VisitorExecution {
    let flow = grid.for_each_cell_in_box(query_box, |cell| visit(cell, &filter, walk));
    if flow == VisitorExecution::Stop || !with_always_visible {
        return flow;
    }
    let cell = grid.always_visible_cell();
    if cell.is_empty() {
        return VisitorExecution::Continue;
    }
    let filter = WalkFilter {
        always_visible: true,
        ..filter
    };
    visit(cell, &filter, walk)
}

impl SpatialSystem for RegularGridSpatialSystem {
    fn start_new_frame(&mut self) {
        self.frame_counter += 1;
        let _span = tracing::info_span!("spatial_start_new_frame", frame = self.frame_counter).entered();

        let free_slots: Vec<usize> = (MAX_NUM_REGULAR_GRIDS..MAX_NUM_GRIDS)
            .filter(|&i| self.grids[i].is_none())
            .collect();
        let plan = self.candidates.plan_frame(&self.config.cache, free_slots);

        for index in plan.evict {
            self.remove_cached_grid(index);
        }
        for created in plan.create {
            tracing::debug!(
                grid = created.grid_index,
                category = created.category.0,
                include = %created.include_tags,
                exclude = %created.exclude_tags,
                "creating cache grid"
            );
            self.grids[created.grid_index] = Some(Box::new(Grid::new_cached(
                created.category,
                self.geometry,
                created.include_tags,
                created.exclude_tags,
            )));
        }
        if plan.exhausted && !self.exhaustion_reported {
            tracing::warn!(limit = crate::data::MAX_NUM_CACHED_GRIDS, "all cache grid slots in use");
            self.exhaustion_reported = true;
        }

        self.migrate_cached_grids();
    }

    fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    fn create_spatial_data(
        &mut self,
        bounds: &BoundingBoxSphere,
        object: EntityId,
        category_bitmask: u32,
        tags: &TagSet,
    ) -> SpatialDataHandle {
        self.add_spatial_data(Some(bounds), object, category_bitmask, tags)
    }

    fn create_spatial_data_always_visible(
        &mut self,
        object: EntityId,
        category_bitmask: u32,
        tags: &TagSet,
    ) -> SpatialDataHandle {
        self.add_spatial_data(None, object, category_bitmask, tags)
    }

    fn delete_spatial_data(&mut self, handle: SpatialDataHandle) -> Result<(), SpatialError> {
        let data = self.data.remove(handle).ok_or_else(|| invalid_handle(handle))?;
        for index in data.grids() {
            if let Some(grid) = self.grids[index].as_deref_mut() {
                grid.remove(handle.index());
            }
        }
        Ok(())
    }

    fn update_spatial_data_bounds(
        &mut self,
        handle: SpatialDataHandle,
        bounds: &BoundingBoxSphere,
    ) -> Result<(), SpatialError> {
        let data = self.lookup(handle)?;
        if data.is_always_visible() {
            return Ok(());
        }
        for index in data.grids() {
            if let Some(grid) = self.grids[index].as_deref_mut() {
                grid.update_bounds(handle.index(), bounds);
            }
        }
        Ok(())
    }

    fn update_spatial_data_object(
        &mut self,
        handle: SpatialDataHandle,
        object: EntityId,
    ) -> Result<(), SpatialError> {
        let data = self.lookup(handle)?;
        for index in data.grids() {
            if let Some(grid) = self.grids[index].as_deref_mut() {
                grid.set_object(handle.index(), object);
            }
        }
        Ok(())
    }

    fn find_objects_in_sphere(
        &self,
        sphere: &Sphere,
        params: &QueryParams<'_>,
        callback: QueryCallback<'_>,
    ) -> QueryStats {
        let _span = tracing::trace_span!("find_objects_in_sphere").entered();
        self.find_objects_in_shape(sphere, params, callback)
    }

    fn find_objects_in_box(
        &self,
        aabb: &Aabb,
        params: &QueryParams<'_>,
        callback: QueryCallback<'_>,
    ) -> QueryStats {
        let _span = tracing::trace_span!("find_objects_in_box").entered();
        self.find_objects_in_shape(aabb, params, callback)
    }

    fn find_visible_objects(
        &self,
        frustum: &Frustum,
        params: &QueryParams<'_>,
        out: &mut Vec<EntityId>,
        is_occluded: Option<IsOccludedFn<'_>>,
        vis_type: VisibilityState,
    ) -> Result<QueryStats, SpatialError> {
        let _span = tracing::trace_span!("find_visible_objects").entered();
        let start = Instant::now();
        let query_box = frustum.bounding_box().ok_or(SpatialError::DegenerateFrustum)?;
        let stamp = (self.frame_counter << 4) | vis_type as u64;
        let mut stats = QueryStats::default();

        self.walk_grids(&query_box, params, true, &mut stats, &mut |cell, filter, walk| {
            if !filter.always_visible {
                if !frustum.intersects_sphere(&cell.bounds.bounding_sphere()) {
                    return VisitorExecution::Continue;
                }
                // The overflow cell spans the whole world; only real cells are occlusion-tested.
                if let Some(occluded) = is_occluded {
                    if cell.key.is_some() && occluded(&cell.bounds) {
                        return VisitorExecution::Continue;
                    }
                }
            }

            walk.tested += cell.len();
            for i in 0..cell.len() {
                let slot = i as u32;
                if !filter.always_visible && !frustum.intersects_sphere(&cell.spheres[i]) {
                    continue;
                }
                if filter.check(cell, i, walk) != Some(true) {
                    continue;
                }
                if !filter.always_visible
                    && is_occluded.is_some_and(|occluded| occluded(&cell.entry_box(slot)))
                {
                    continue;
                }
                walk.passed += 1;
                cell.mark_visible(slot, stamp);
                out.push(cell.objects[i]);
            }
            VisitorExecution::Continue
        });

        stats.time_taken = start.elapsed();
        Ok(stats)
    }

    fn get_visibility_state(
        &self,
        handle: SpatialDataHandle,
        num_frames_before_invisible: u32,
    ) -> Result<VisibilityState, SpatialError> {
        let data = self.lookup(handle)?;
        if data.is_always_visible() {
            return Ok(VisibilityState::Direct);
        }

        let last_visible = data
            .grids()
            .filter_map(|gi| self.grids[gi].as_deref()?.last_visible(handle.index()))
            .max()
            .unwrap_or(0);
        let state = VisibilityState::from_bits(last_visible & 0xf);
        if state == VisibilityState::Invisible {
            return Ok(VisibilityState::Invisible);
        }

        let age = self.frame_counter.saturating_sub(last_visible >> 4);
        Ok(if age == 0 {
            state
        } else if age < num_frames_before_invisible as u64 {
            VisibilityState::Indirect
        } else {
            VisibilityState::Invisible
        })
    }
}

/// Per-grid counters reported by [`RegularGridSpatialSystem::internal_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct GridStats {
    pub grid_index: usize,
    pub category: Category,
    pub category_name: Option<String>,
    pub cached: bool,
    pub can_be_cached: bool,
    pub include_tags: TagSet,
    pub exclude_tags: TagSet,
    pub num_cells: usize,
    pub num_entries: usize,
    pub num_always_visible: usize,
    /// 1.0 once a cache grid has copied every source entry.
    pub migration_progress: f32,
}

/// Snapshot of the system for debugging tools.
#[derive(Debug, Clone, Serialize)]
pub struct InternalStats {
    pub frame_counter: u64,
    pub num_spatial_data: usize,
    pub grids: Vec<GridStats>,
    pub candidates: Vec<CandidateStats>,
}

impl fmt::Display for InternalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frame {}: {} spatial data in {} grids",
            self.frame_counter,
            self.num_spatial_data,
            self.grids.len()
        )?;
        for g in &self.grids {
            let name = g.category_name.as_deref().unwrap_or("?");
            if g.cached {
                writeln!(
                    f,
                    "  cache #{:<2} {name} include {} exclude {}: {} entries in {} cells ({:.0}% migrated)",
                    g.grid_index,
                    g.include_tags,
                    g.exclude_tags,
                    g.num_entries,
                    g.num_cells,
                    g.migration_progress * 100.0
                )?;
            } else {
                writeln!(
                    f,
                    "  grid  #{:<2} {name}: {} entries in {} cells, {} always visible{}",
                    g.grid_index,
                    g.num_entries,
                    g.num_cells,
                    g.num_always_visible,
                    if g.can_be_cached { "" } else { " (not cacheable)" }
                )?;
            }
        }
        for c in &self.candidates {
            writeln!(
                f,
                "  candidate category {} include {} exclude {}: score {:.1} (queries {:.1}, filtered {:.2}){}",
                c.category.0,
                c.include_tags,
                c.exclude_tags,
                c.score,
                c.query_count,
                c.filtered_ratio,
                match c.grid_index {
                    Some(i) => format!(" -> grid #{i}"),
                    None => String::new(),
                }
            )?;
        }
        Ok(())
    }
}
