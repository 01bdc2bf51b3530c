//! Spatial partitioning: sparse regular grids per category, tag-filtered
//! cache grids, frustum culling with visibility tracking.
//!
//! # Invariants
//! - Every live handle is in the regular grid of each category bit it was
//!   created with, and in every completed or migrating cache grid whose
//!   filter it matches.
//! - A query reports each object at most once, even when the object sits in
//!   several queried grids.
//! - A cache grid answers queries only after it has copied every matching
//!   entry of its source grid.
//! - Queries never move data; they may run concurrently.
//!
//! # Cache grids
//! Tag-filtered queries that reject many objects are tracked as cache
//! candidates. Candidates whose score stays high get a grid holding only the
//! matching subset, filled over several frames by `start_new_frame` and
//! removed again once the query stops being used.

mod cache;
mod category;
mod cell;
mod config;
mod data;
mod error;
mod grid;
mod id_table;
mod query;
mod regular_grid;
mod system;

pub use cache::CandidateStats;
pub use category::{Category, CategoryFlags, CategoryRegistry};
pub use config::{CacheConfig, SpatialConfig};
pub use data::{GridBits, MAX_NUM_CACHED_GRIDS, MAX_NUM_GRIDS, MAX_NUM_REGULAR_GRIDS, SpatialData};
pub use error::SpatialError;
pub use id_table::{IdTable, SpatialDataHandle};
pub use query::{QueryParams, QueryStats, VisibilityState, VisitorExecution};
pub use regular_grid::{GridStats, InternalStats, RegularGridSpatialSystem};
pub use system::{IsOccludedFn, QueryCallback, SpatialSystem};

pub fn crate_info() -> &'static str {
    "gridspace-spatial v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("spatial"));
    }
}
