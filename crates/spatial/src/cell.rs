use glam::Vec3;
use gridspace_common::{Aabb, BoundingBoxSphere, EntityId, Sphere, TagSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything a cell stores for one piece of spatial data.
#[derive(Debug, Clone)]
pub(crate) struct CellEntry {
    pub bounds: BoundingBoxSphere,
    pub tags: TagSet,
    pub object: EntityId,
    pub category_bitmask: u32,
    /// `(frame << 4) | visibility state` of the last sighting, 0 if never seen.
    pub last_visible: u64,
}

/// One grid cell. Entry attributes are kept in parallel arrays so the hot
/// loops only touch the spheres until an entry passes the shape test.
#[derive(Debug)]
pub(crate) struct Cell {
    /// Cell extents inflated by the overlap margin.
    pub bounds: Aabb,
    /// Key in the grid's cell map; `None` for the overflow and always-visible cells.
    pub key: Option<u64>,
    pub spheres: Vec<Sphere>,
    pub half_extents: Vec<Vec3>,
    pub tags: Vec<TagSet>,
    pub objects: Vec<EntityId>,
    pub categories: Vec<u32>,
    pub last_visible: Vec<AtomicU64>,
    pub data_indices: Vec<u32>,
}

impl Cell {
    pub fn new(bounds: Aabb, key: Option<u64>) -> Self {
        Self {
            bounds,
            key,
            spheres: Vec::new(),
            half_extents: Vec::new(),
            tags: Vec::new(),
            objects: Vec::new(),
            categories: Vec::new(),
            last_visible: Vec::new(),
            data_indices: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.spheres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spheres.is_empty()
    }

    /// Append an entry and return its position.
    pub fn add(&mut self, entry: CellEntry, data_index: u32) -> u32 {
        self.spheres.push(entry.bounds.sphere());
        self.half_extents.push(entry.bounds.half_extents);
        self.tags.push(entry.tags);
        self.objects.push(entry.object);
        self.categories.push(entry.category_bitmask);
        self.last_visible.push(AtomicU64::new(entry.last_visible));
        self.data_indices.push(data_index);
        (self.spheres.len() - 1) as u32
    }

    /// Swap-remove the entry at `slot`. Returns the removed entry and, if
    /// another entry was moved into `slot`, that entry's data index.
    pub fn remove(&mut self, slot: u32) -> (CellEntry, Option<u32>) {
        let i = slot as usize;
        let sphere = self.spheres.swap_remove(i);
        let half_extents = self.half_extents.swap_remove(i);
        let entry = CellEntry {
            bounds: BoundingBoxSphere::new(sphere.center, half_extents, sphere.radius),
            tags: self.tags.swap_remove(i),
            object: self.objects.swap_remove(i),
            category_bitmask: self.categories.swap_remove(i),
            last_visible: self.last_visible.swap_remove(i).into_inner(),
        };
        self.data_indices.swap_remove(i);
        let moved = self.data_indices.get(i).copied();
        (entry, moved)
    }

    /// Copy of the entry at `slot`.
    pub fn entry(&self, slot: u32) -> CellEntry {
        let i = slot as usize;
        CellEntry {
            bounds: self.entry_bounds(slot),
            tags: self.tags[i].clone(),
            object: self.objects[i],
            category_bitmask: self.categories[i],
            last_visible: self.last_visible(slot),
        }
    }

    pub fn entry_bounds(&self, slot: u32) -> BoundingBoxSphere {
        let i = slot as usize;
        let sphere = self.spheres[i];
        BoundingBoxSphere::new(sphere.center, self.half_extents[i], sphere.radius)
    }

    pub fn entry_box(&self, slot: u32) -> Aabb {
        let i = slot as usize;
        Aabb::from_center_half_extents(self.spheres[i].center, self.half_extents[i])
    }

    pub fn set_bounds(&mut self, slot: u32, bounds: &BoundingBoxSphere) {
        let i = slot as usize;
        self.spheres[i] = bounds.sphere();
        self.half_extents[i] = bounds.half_extents;
    }

    pub fn last_visible(&self, slot: u32) -> u64 {
        self.last_visible[slot as usize].load(Ordering::Relaxed)
    }

    /// Record a sighting; concurrent queries keep the newest/strongest stamp.
    pub fn mark_visible(&self, slot: u32, stamp: u64) {
        self.last_visible[slot as usize].fetch_max(stamp, Ordering::Relaxed);
    }
}
