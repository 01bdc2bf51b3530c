/// Number of grids a data record can belong to (bits 0..=62).
pub const MAX_NUM_GRIDS: usize = 63;
/// One regular grid per bit of the `u32` category bitmask.
pub const MAX_NUM_REGULAR_GRIDS: usize = 32;
/// Remaining grid bits are available to cache grids.
pub const MAX_NUM_CACHED_GRIDS: usize = MAX_NUM_GRIDS - MAX_NUM_REGULAR_GRIDS;

const ALWAYS_VISIBLE_BIT: u64 = 1 << 63;
const GRID_MASK: u64 = !ALWAYS_VISIBLE_BIT;

/// Per-handle record: which grids hold the data, plus the always-visible flag.
///
/// Layout: bits 0..=62 are grid membership, bit 63 is the always-visible flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpatialData(u64);

impl SpatialData {
    pub fn new(grid_bitmask: u64, always_visible: bool) -> Self {
        let mut bits = grid_bitmask & GRID_MASK;
        if always_visible {
            bits |= ALWAYS_VISIBLE_BIT;
        }
        Self(bits)
    }

    pub fn grid_bitmask(&self) -> u64 {
        self.0 & GRID_MASK
    }

    pub fn is_always_visible(&self) -> bool {
        self.0 & ALWAYS_VISIBLE_BIT != 0
    }

    pub fn is_in_grid(&self, grid_index: usize) -> bool {
        debug_assert!(grid_index < MAX_NUM_GRIDS);
        self.0 & (1 << grid_index) != 0
    }

    pub fn set_grid(&mut self, grid_index: usize) {
        debug_assert!(grid_index < MAX_NUM_GRIDS);
        self.0 |= 1 << grid_index;
    }

    pub fn clear_grid(&mut self, grid_index: usize) {
        debug_assert!(grid_index < MAX_NUM_GRIDS);
        self.0 &= !(1 << grid_index);
    }

    /// Grid indices in ascending order.
    pub fn grids(&self) -> GridBits {
        GridBits(self.grid_bitmask())
    }
}

/// Iterator over the set bits of a grid bitmask, lowest first.
#[derive(Debug, Clone, Copy)]
pub struct GridBits(pub u64);

impl Iterator for GridBits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(index)
    }
}
