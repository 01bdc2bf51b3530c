use gridspace_common::TagSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;

use crate::category::Category;
use crate::config::CacheConfig;
use crate::data::MAX_NUM_CACHED_GRIDS;
use crate::query::tag_sets_equal;

/// Running statistics for one `(category, include, exclude)` query filter.
#[derive(Debug, Clone)]
struct CacheCandidate {
    category: Category,
    include_tags: TagSet,
    exclude_tags: TagSet,
    query_count: f32,
    filtered_ratio: f32,
    grid_index: Option<usize>,
}

impl CacheCandidate {
    fn matches(&self, category: Category, include: Option<&TagSet>, exclude: Option<&TagSet>) -> bool {
        self.category == category
            && tag_sets_equal(&self.include_tags, include)
            && tag_sets_equal(&self.exclude_tags, exclude)
    }

    fn score(&self, config: &CacheConfig) -> f32 {
        self.query_count + self.filtered_ratio * config.filtered_ratio_weight
    }
}

/// A cache grid the system should create this frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NewCacheGrid {
    pub grid_index: usize,
    pub category: Category,
    pub include_tags: TagSet,
    pub exclude_tags: TagSet,
}

/// What `start_new_frame` has to do to the cache grids.
#[derive(Debug, Default)]
pub(crate) struct FramePlan {
    pub evict: Vec<usize>,
    pub create: Vec<NewCacheGrid>,
    /// A candidate qualified but no grid slot was free.
    pub exhausted: bool,
}

/// Snapshot of one candidate for diagnostics, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateStats {
    pub category: Category,
    pub include_tags: TagSet,
    pub exclude_tags: TagSet,
    pub score: f32,
    pub query_count: f32,
    pub filtered_ratio: f32,
    pub grid_index: Option<usize>,
}

/// Candidate table shared by concurrent queries. The lock is only held while
/// reading or updating scores.
#[derive(Debug, Default)]
pub(crate) struct CacheCandidates {
    candidates: Mutex<Vec<CacheCandidate>>,
}

impl CacheCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one query for the filter. `filtered_ratio` is the fraction of
    /// spatially matching objects rejected by tags (0 for cache-grid hits).
    pub fn record_query(
        &self,
        category: Category,
        include: Option<&TagSet>,
        exclude: Option<&TagSet>,
        filtered_ratio: f32,
        config: &CacheConfig,
    ) {
        let mut candidates = self.candidates.lock();
        if let Some(c) = candidates
            .iter_mut()
            .find(|c| c.matches(category, include, exclude))
        {
            c.query_count = (c.query_count + 1.0).min(config.max_query_count);
            c.filtered_ratio += (filtered_ratio - c.filtered_ratio) * config.ratio_smoothing;
            return;
        }

        candidates.push(CacheCandidate {
            category,
            include_tags: include.cloned().unwrap_or_default(),
            exclude_tags: exclude.cloned().unwrap_or_default(),
            query_count: 1.0,
            filtered_ratio,
            grid_index: None,
        });
    }

    /// Score, decay and rank the candidates, then decide which cache grids to
    /// evict and which to create. `free_slots` lists unused cache grid indices.
    pub fn plan_frame(&self, config: &CacheConfig, mut free_slots: Vec<usize>) -> FramePlan {
        let mut candidates = self.candidates.lock();
        let mut plan = FramePlan::default();

        let mut ranked: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.score(config)))
            .collect();
        for c in candidates.iter_mut() {
            c.query_count *= config.decay_factor;
            c.filtered_ratio *= config.decay_factor;
        }
        ranked.sort_by(|a, b| compare_rank(a, b, &candidates));

        for (rank, &(i, score)) in ranked.iter().enumerate() {
            let c = &mut candidates[i];
            let Some(grid_index) = c.grid_index else {
                continue;
            };
            if rank >= MAX_NUM_CACHED_GRIDS || score < config.eviction_score {
                plan.evict.push(grid_index);
                c.grid_index = None;
                c.query_count = 0.0;
                c.filtered_ratio = 0.0;
            }
        }

        free_slots.extend(plan.evict.iter().copied());
        free_slots.sort_unstable();

        for (rank, &(i, score)) in ranked.iter().enumerate() {
            let c = &mut candidates[i];
            if c.grid_index.is_some() || score < config.promotion_score {
                continue;
            }
            // Highest free slot first, matching how cache grids fill from the top.
            let grid_index = match free_slots.pop() {
                Some(slot) if rank < MAX_NUM_CACHED_GRIDS => slot,
                _ => {
                    plan.exhausted = true;
                    break;
                }
            };
            c.grid_index = Some(grid_index);
            plan.create.push(NewCacheGrid {
                grid_index,
                category: c.category,
                include_tags: c.include_tags.clone(),
                exclude_tags: c.exclude_tags.clone(),
            });
        }

        candidates.retain(|c| c.grid_index.is_some() || c.score(config) >= config.eviction_score);
        plan
    }

    /// Drop every grid assignment. Returns the grid indices that were in use.
    pub fn clear_grids(&self) -> Vec<usize> {
        let mut candidates = self.candidates.lock();
        let mut released = Vec::new();
        for c in candidates.iter_mut() {
            if let Some(grid_index) = c.grid_index.take() {
                released.push(grid_index);
                c.query_count = 0.0;
                c.filtered_ratio = 0.0;
            }
        }
        released
    }

    /// Candidates in rank order with their current scores.
    pub fn snapshot(&self, config: &CacheConfig) -> Vec<CandidateStats> {
        let candidates = self.candidates.lock();
        let mut ranked: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.score(config)))
            .collect();
        ranked.sort_by(|a, b| compare_rank(a, b, &candidates));
        ranked
            .into_iter()
            .map(|(i, score)| {
                let c = &candidates[i];
                CandidateStats {
                    category: c.category,
                    include_tags: c.include_tags.clone(),
                    exclude_tags: c.exclude_tags.clone(),
                    score,
                    query_count: c.query_count,
                    filtered_ratio: c.filtered_ratio,
                    grid_index: c.grid_index,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.lock().len()
    }
}

/// Higher score first; ties go to the lower grid index (uncached last), then
/// to the older candidate.
fn compare_rank(a: &(usize, f32), b: &(usize, f32), candidates: &[CacheCandidate]) -> Ordering {
    let grid = |i: usize| candidates[i].grid_index.unwrap_or(usize::MAX);
    b.1.total_cmp(&a.1)
        .then_with(|| grid(a.0).cmp(&grid(b.0)))
        .then_with(|| a.0.cmp(&b.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridspace_common::Tag;

    fn tags(ids: &[u16]) -> TagSet {
        ids.iter().map(|&i| Tag(i)).collect()
    }

    fn free_slots() -> Vec<usize> {
        (32..63).collect()
    }

    #[test]
    fn repeated_queries_accumulate() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        let foliage = tags(&[1]);
        for _ in 0..3 {
            table.record_query(Category(0), Some(&foliage), None, 0.5, &config);
        }
        // An empty exclude set is the same filter as no exclude set.
        table.record_query(Category(0), Some(&foliage), Some(&TagSet::new()), 0.5, &config);
        assert_eq!(table.len(), 1);

        let stats = table.snapshot(&config);
        assert_eq!(stats[0].query_count, 4.0);
        assert!((stats[0].filtered_ratio - 0.5).abs() < 1e-6);
        assert!((stats[0].score - 54.0).abs() < 1e-4);
    }

    #[test]
    fn query_count_is_capped() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        for _ in 0..500 {
            table.record_query(Category(0), None, None, 0.0, &config);
        }
        assert_eq!(table.snapshot(&config)[0].query_count, config.max_query_count);
    }

    #[test]
    fn ratio_moves_toward_measurements() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        let t = tags(&[1]);
        table.record_query(Category(0), Some(&t), None, 0.8, &config);
        table.record_query(Category(0), Some(&t), None, 0.0, &config);
        let ratio = table.snapshot(&config)[0].filtered_ratio;
        assert!((ratio - 0.6).abs() < 1e-6);
    }

    #[test]
    fn high_score_gets_highest_free_slot() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        let t = tags(&[1]);
        table.record_query(Category(3), Some(&t), None, 0.9, &config);

        let plan = table.plan_frame(&config, free_slots());
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].grid_index, 62);
        assert_eq!(plan.create[0].category, Category(3));
        assert_eq!(plan.create[0].include_tags, t);
        assert!(plan.evict.is_empty());

        // Already cached: no second grid.
        let plan = table.plan_frame(&config, (32..62).collect());
        assert!(plan.create.is_empty());
    }

    #[test]
    fn low_score_is_not_promoted_and_gets_pruned() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        table.record_query(Category(0), Some(&tags(&[1])), None, 0.2, &config);

        // 1 + 20 < 50
        let plan = table.plan_frame(&config, free_slots());
        assert!(plan.create.is_empty());
        assert_eq!(table.len(), 1);

        for _ in 0..100 {
            table.plan_frame(&config, free_slots());
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unused_cache_grid_is_evicted_after_decay() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        table.record_query(Category(0), Some(&tags(&[1])), None, 0.9, &config);
        let plan = table.plan_frame(&config, free_slots());
        let grid = plan.create[0].grid_index;

        let mut evicted_after = None;
        for frame in 0..200 {
            let plan = table.plan_frame(&config, Vec::new());
            if plan.evict.contains(&grid) {
                evicted_after = Some(frame);
                break;
            }
        }
        assert!(evicted_after.is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn qualifying_candidates_beyond_grid_limit_report_exhaustion() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        for tag in 1..=MAX_NUM_CACHED_GRIDS as u16 + 1 {
            table.record_query(Category(0), Some(&tags(&[tag])), None, 0.9, &config);
        }
        let plan = table.plan_frame(&config, free_slots());
        assert_eq!(plan.create.len(), MAX_NUM_CACHED_GRIDS);
        assert!(plan.exhausted);
        assert!(plan.create.iter().all(|g| g.include_tags != tags(&[32])));
    }

    #[test]
    fn exhaustion_is_reported_without_free_slots() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        table.record_query(Category(0), Some(&tags(&[1])), None, 0.9, &config);
        let plan = table.plan_frame(&config, Vec::new());
        assert!(plan.exhausted);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn ties_rank_lower_grid_index_first() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        let a = tags(&[1]);
        let b = tags(&[2]);
        table.record_query(Category(0), Some(&a), None, 0.9, &config);
        table.record_query(Category(0), Some(&b), None, 0.9, &config);

        let plan = table.plan_frame(&config, vec![40, 50]);
        // Equal scores: the older candidate ranks first and takes the higher slot.
        assert_eq!(plan.create[0].include_tags, a);
        assert_eq!(plan.create[0].grid_index, 50);
        assert_eq!(plan.create[1].grid_index, 40);

        let ranked = table.snapshot(&config);
        assert_eq!(ranked[0].grid_index, Some(40));
        assert_eq!(ranked[1].grid_index, Some(50));
    }

    #[test]
    fn clear_grids_releases_all_slots() {
        let config = CacheConfig::default();
        let table = CacheCandidates::new();
        table.record_query(Category(0), Some(&tags(&[1])), None, 0.9, &config);
        table.plan_frame(&config, free_slots());
        assert_eq!(table.clear_grids(), vec![62]);
        assert!(table.clear_grids().is_empty());
    }
}
