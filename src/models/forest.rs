use log::{debug, trace};

use crate::models::base_model::{DiVector, ScoreDescriptor, ScoringBackend};
use crate::models::sampler::median_in_place;
use crate::models::tree::{RandomCutTree, SEED_STRIDE};

/// Ensemble of reservoir-backed random cut trees.
///
/// Scores are averaged over the trees and stay at zero until `output_after`
/// updates have been absorbed, so a handful of early points cannot raise
/// alerts. Tree `i` is seeded with `seed + i * SEED_STRIDE`, which makes the
/// whole ensemble reproducible from a single seed.
#[derive(Clone, Debug)]
pub struct RandomCutForest {
    trees: Vec<RandomCutTree>,
    dimensions: usize,
    shingle_size: usize,
    sample_size: usize,
    seed: u64,
    total_updates: u64,
    output_after: u64,
    neighbor_count: usize,
    cache_fraction: f64,
}

impl RandomCutForest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dimensions: usize,
        shingle_size: usize,
        number_of_trees: usize,
        sample_size: usize,
        time_decay: f64,
        output_after: u64,
        neighbor_count: usize,
        seed: u64,
    ) -> Self {
        let trees = (0..number_of_trees)
            .map(|i| {
                let tree_seed = seed.wrapping_add((i as u64).wrapping_mul(SEED_STRIDE));
                RandomCutTree::new(sample_size, dimensions, time_decay, tree_seed)
            })
            .collect();
        RandomCutForest {
            trees,
            dimensions,
            shingle_size,
            sample_size,
            seed,
            total_updates: 0,
            output_after,
            neighbor_count: neighbor_count.max(1),
            cache_fraction: 1.0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        trees: Vec<RandomCutTree>,
        dimensions: usize,
        shingle_size: usize,
        sample_size: usize,
        seed: u64,
        total_updates: u64,
        output_after: u64,
        neighbor_count: usize,
        cache_fraction: f64,
    ) -> Self {
        let mut forest = RandomCutForest {
            trees,
            dimensions,
            shingle_size,
            sample_size,
            seed,
            total_updates,
            output_after,
            neighbor_count: neighbor_count.max(1),
            cache_fraction,
        };
        forest.set_cache_fraction(cache_fraction);
        forest
    }

    pub fn trees(&self) -> &[RandomCutTree] {
        &self.trees
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn output_after(&self) -> u64 {
        self.output_after
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_count
    }

    /// Mean per-tree score, ignoring warm-up.
    pub fn raw_score(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self.trees.iter().map(|t| t.score(point)).sum();
        total / self.trees.len() as f64
    }

    /// Median deviation of `point` from each tree's reservoir, averaged.
    pub fn attribution(&self, point: &[f64]) -> Option<DiVector> {
        let mut attribution = DiVector::zeros(self.dimensions);
        let contributing = self
            .trees
            .iter()
            .filter(|t| t.add_attribution(point, &mut attribution))
            .count();
        if contributing == 0 {
            return None;
        }
        attribution.scale(1.0 / contributing as f64);
        Some(attribution)
    }

    /// Per-dimension median over the nearest neighbours pooled from every tree.
    pub fn expected_point(&self, point: &[f64], ignored: &[usize]) -> Option<Vec<f64>> {
        let pooled: Vec<_> = self
            .trees
            .iter()
            .flat_map(|t| t.neighbors(point, self.neighbor_count, ignored))
            .collect();
        if pooled.is_empty() {
            return None;
        }
        let mut column = Vec::with_capacity(pooled.len());
        let expected = (0..self.dimensions)
            .map(|d| {
                column.clear();
                column.extend(pooled.iter().map(|row| row[d]));
                median_in_place(&mut column)
            })
            .collect();
        Some(expected)
    }
}

impl ScoringBackend for RandomCutForest {
    fn score(&self, point: &[f64]) -> ScoreDescriptor {
        if !self.is_output_ready() {
            return ScoreDescriptor::empty();
        }
        let score = self.raw_score(point);
        trace!("forest score {score:.6} after {} updates", self.total_updates);
        ScoreDescriptor {
            score,
            expected_point: self.expected_point(point, &[]),
            attribution: self.attribution(point),
        }
    }

    fn update(&mut self, point: &[f64]) {
        for tree in &mut self.trees {
            tree.update(point);
        }
        self.total_updates += 1;
        if self.total_updates == self.output_after {
            debug!(
                "forest ready after {} updates ({} trees, sample size {})",
                self.total_updates,
                self.trees.len(),
                self.sample_size
            );
        }
    }

    fn impute(&self, point: &[f64], positions: &[usize]) -> Option<Vec<f64>> {
        if !self.is_output_ready() || positions.is_empty() {
            return None;
        }
        let expected = self.expected_point(point, positions)?;
        let mut imputed = point.to_vec();
        for &p in positions {
            if p < imputed.len() {
                imputed[p] = expected[p];
            }
        }
        Some(imputed)
    }

    fn total_updates(&self) -> u64 {
        self.total_updates
    }

    fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_output_ready(&self) -> bool {
        self.total_updates >= self.output_after
    }

    fn cache_fraction(&self) -> f64 {
        self.cache_fraction
    }

    /// The first `round(fraction * trees)` trees keep their summaries.
    fn set_cache_fraction(&mut self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.cache_fraction = fraction;
        let cached = (fraction * self.trees.len() as f64).round() as usize;
        for (i, tree) in self.trees.iter_mut().enumerate() {
            tree.set_caching(i < cached);
        }
    }
}
