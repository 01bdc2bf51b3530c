use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SpatialError;

/// Geometry of every grid owned by a spatial system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Edge length of a cell in world units.
    pub cell_size: u32,
    /// Margin added around each cell, as a fraction of `cell_size`. Objects
    /// whose box fits into the inflated cell stay in it; larger ones go to the
    /// grid's overflow cell.
    pub overlap_fraction: f32,
    pub cache: CacheConfig,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_size: 128,
            overlap_fraction: 0.25,
            cache: CacheConfig::default(),
        }
    }
}

/// Thresholds driving cache-grid promotion and eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Minimum number of objects that must pass the spatial test of a
    /// tag-filtered query before it is considered for caching.
    pub caching_threshold: u32,
    /// Minimum fraction of objects rejected by tags for a query to count.
    pub min_filtered_ratio: f32,
    /// Score weight of the filtered ratio relative to the query count.
    pub filtered_ratio_weight: f32,
    /// Cap on the query count of a single candidate.
    pub max_query_count: f32,
    /// Per-frame multiplicative decay of query count and filtered ratio.
    pub decay_factor: f32,
    /// How quickly a new filtered-ratio measurement replaces the old estimate.
    pub ratio_smoothing: f32,
    /// Candidates scoring at least this get a cache grid.
    pub promotion_score: f32,
    /// Cache grids whose candidate scores below this are removed.
    pub eviction_score: f32,
    /// Entries copied into a new cache grid per frame.
    pub migration_batch_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            caching_threshold: 100,
            min_filtered_ratio: 0.1,
            filtered_ratio_weight: 100.0,
            max_query_count: 100.0,
            decay_factor: 0.95,
            ratio_smoothing: 0.25,
            promotion_score: 50.0,
            eviction_score: 1.0,
            migration_batch_size: 64,
        }
    }
}

impl SpatialConfig {
    /// Parse a YAML document. Missing keys take their default.
    pub fn from_yaml_str(s: &str) -> Result<Self, SpatialError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SpatialError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SpatialError> {
        if self.cell_size == 0 {
            return Err(SpatialError::InvalidConfig("cell_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.overlap_fraction) {
            return Err(SpatialError::InvalidConfig(
                "overlap_fraction must be within [0, 1]".into(),
            ));
        }
        self.cache.validate()
    }

    pub(crate) fn overlap_size(&self) -> f32 {
        self.cell_size as f32 * self.overlap_fraction
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), SpatialError> {
        if !(0.0..=1.0).contains(&self.decay_factor) {
            return Err(SpatialError::InvalidConfig(
                "decay_factor must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ratio_smoothing) {
            return Err(SpatialError::InvalidConfig(
                "ratio_smoothing must be within [0, 1]".into(),
            ));
        }
        if self.eviction_score > self.promotion_score {
            return Err(SpatialError::InvalidConfig(
                "eviction_score must not exceed promotion_score".into(),
            ));
        }
        if self.migration_batch_size == 0 {
            return Err(SpatialError::InvalidConfig(
                "migration_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
