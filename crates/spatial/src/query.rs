use gridspace_common::TagSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Returned by visitors to continue or abort an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitorExecution {
    Continue,
    Stop,
}

/// How visible an object was, ordered so that a later or stronger sighting
/// compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VisibilityState {
    /// Not seen recently.
    Invisible = 0,
    /// Seen through a secondary view (shadows, reflections) or within the
    /// tolerance window after its last direct sighting.
    Indirect = 1,
    /// Seen by a main view this frame.
    Direct = 2,
}

impl VisibilityState {
    pub(crate) fn from_bits(bits: u64) -> Self {
        match bits {
            2 => Self::Direct,
            1 => Self::Indirect,
            _ => Self::Invisible,
        }
    }
}

/// Filter applied to a query: which categories, which tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryParams<'a> {
    pub category_bitmask: u32,
    /// Objects must carry at least one of these tags (ignored when empty).
    pub include_tags: Option<&'a TagSet>,
    /// Objects carrying any of these tags are rejected (ignored when empty).
    pub exclude_tags: Option<&'a TagSet>,
}

impl<'a> QueryParams<'a> {
    pub fn new(category_bitmask: u32) -> Self {
        Self {
            category_bitmask,
            include_tags: None,
            exclude_tags: None,
        }
    }

    pub fn with_include_tags(mut self, tags: &'a TagSet) -> Self {
        self.include_tags = Some(tags);
        self
    }

    pub fn with_exclude_tags(mut self, tags: &'a TagSet) -> Self {
        self.exclude_tags = Some(tags);
        self
    }

    /// True if per-object tag tests are needed on untagged grids.
    pub fn uses_tags(&self) -> bool {
        self.include_tags.is_some_and(|t| !t.is_empty())
            || self.exclude_tags.is_some_and(|t| !t.is_empty())
    }

    /// True if `tags` fail the include/exclude filter.
    pub(crate) fn rejects(&self, tags: &TagSet) -> bool {
        filter_by_tags(tags, self.include_tags, self.exclude_tags)
    }
}

/// True if `tags` are rejected by the include/exclude pair.
pub(crate) fn filter_by_tags(tags: &TagSet, include: Option<&TagSet>, exclude: Option<&TagSet>) -> bool {
    if let Some(exclude) = exclude {
        if !exclude.is_empty() && exclude.is_any_set(tags) {
            return true;
        }
    }
    if let Some(include) = include {
        if !include.is_empty() && !include.is_any_set(tags) {
            return true;
        }
    }
    false
}

/// An absent tag set equals an empty one.
pub(crate) fn tag_sets_equal(a: &TagSet, b: Option<&TagSet>) -> bool {
    match b {
        Some(b) => a == b,
        None => a.is_empty(),
    }
}

/// Work counters for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Live spatial data in the system when the query ran.
    pub total_num_objects: usize,
    /// Entries whose bounds were tested against the query shape.
    pub num_objects_tested: usize,
    /// Entries reported to the caller.
    pub num_objects_passed: usize,
    /// Entries that passed the shape test but were rejected by tags.
    pub num_objects_filtered: usize,
    pub time_taken: Duration,
}

impl QueryStats {
    pub(crate) fn accumulate(&mut self, other: &GridWalkStats) {
        self.num_objects_tested += other.tested;
        self.num_objects_passed += other.passed;
        self.num_objects_filtered += other.filtered;
    }
}

/// Counters for the walk over a single grid.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GridWalkStats {
    pub tested: usize,
    pub passed: usize,
    pub filtered: usize,
}

impl GridWalkStats {
    /// Fraction of spatially-matching entries rejected by tags.
    pub fn filtered_ratio(&self) -> f32 {
        let total = self.passed + self.filtered;
        if total == 0 {
            0.0
        } else {
            self.filtered as f32 / total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_common::Tag;

    fn tags(ids: &[u16]) -> TagSet {
        ids.iter().map(|&i| Tag(i)).collect()
    }

    #[test]
    fn visibility_orders_by_strength() {
        assert!(VisibilityState::Direct > VisibilityState::Indirect);
        assert!(VisibilityState::Indirect > VisibilityState::Invisible);
        assert_eq!(VisibilityState::from_bits(VisibilityState::Direct as u64), VisibilityState::Direct);
        assert_eq!(VisibilityState::from_bits(9), VisibilityState::Invisible);
    }

    #[test]
    fn empty_filters_accept_everything() {
        let params = QueryParams::new(1);
        assert!(!params.uses_tags());
        assert!(!params.rejects(&tags(&[1, 2])));

        let empty = TagSet::new();
        let params = QueryParams::new(1).with_include_tags(&empty);
        assert!(!params.uses_tags());
        assert!(!params.rejects(&TagSet::new()));
    }

    #[test]
    fn include_and_exclude() {
        let include = tags(&[1]);
        let exclude = tags(&[2]);
        let params = QueryParams::new(1)
            .with_include_tags(&include)
            .with_exclude_tags(&exclude);
        assert!(params.uses_tags());
        assert!(!params.rejects(&tags(&[1])));
        assert!(params.rejects(&tags(&[1, 2])));
        assert!(params.rejects(&tags(&[3])));
        assert!(params.rejects(&TagSet::new()));
    }

    #[test]
    fn missing_tag_set_equals_empty() {
        assert!(tag_sets_equal(&TagSet::new(), None));
        assert!(!tag_sets_equal(&tags(&[1]), None));
        assert!(tag_sets_equal(&tags(&[1]), Some(&tags(&[1]))));
    }

    #[test]
    fn filtered_ratio() {
        let stats = GridWalkStats {
            tested: 10,
            passed: 3,
            filtered: 1,
        };
        assert!((stats.filtered_ratio() - 0.25).abs() < 1e-6);
        assert_eq!(GridWalkStats::default().filtered_ratio(), 0.0);
    }
}
