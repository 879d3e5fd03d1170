use ndarray::ArrayView1;

use crate::models::base_model::DiVector;
use crate::models::sampler::ReservoirSampler;
use crate::utils::random::Lcg48;

/// Stride between the seeds of consecutive trees in a forest.
pub const SEED_STRIDE: u64 = 7919;

// Mixes the update count into the scoring generator's seed.
const SCORING_STREAM: u64 = 0x2545_F491_4F6C_DD1D;

const EULER_GAMMA: f64 = 0.5772156649;

/// Cached per-tree summary of the reservoir.
#[derive(Clone, Debug, PartialEq)]
struct Summary {
    lo: Vec<f64>,
    hi: Vec<f64>,
    medians: Vec<f64>,
}

/// One member of the ensemble: a reservoir of feature vectors plus the
/// generator that drives every random decision made on it.
///
/// The tree is not materialised. Scoring replays random cuts against the
/// reservoir until the query stands alone, which gives the same isolation
/// depth a randomly grown tree would, with memory bounded by the reservoir.
#[derive(Clone, Debug)]
pub struct RandomCutTree {
    seed: u64,
    sampler: ReservoirSampler,
    rng: Lcg48,
    caching: bool,
    summary: Option<Summary>,
}

impl RandomCutTree {
    pub fn new(capacity: usize, dimensions: usize, time_decay: f64, seed: u64) -> Self {
        RandomCutTree {
            seed,
            sampler: ReservoirSampler::new(capacity, dimensions, time_decay),
            rng: Lcg48::new(seed),
            caching: true,
            summary: None,
        }
    }

    pub(crate) fn from_parts(seed: u64, rng: Lcg48, sampler: ReservoirSampler, caching: bool) -> Self {
        let mut tree = RandomCutTree {
            seed,
            sampler,
            rng,
            caching: false,
            summary: None,
        };
        tree.set_caching(caching);
        tree
    }

    pub fn update(&mut self, point: &[f64]) {
        let accepted = self.sampler.accept(point, &mut self.rng);
        if !self.caching {
            self.summary = None;
        } else if accepted.is_some() || self.summary.is_none() {
            self.summary = self.summarize();
        }
    }

    /// Keep (or drop) the bounding box and medians between calls. Results
    /// are identical either way; only the amount of recomputation changes.
    pub fn set_caching(&mut self, caching: bool) {
        self.caching = caching;
        if caching {
            if self.summary.is_none() {
                self.summary = self.summarize();
            }
        } else {
            self.summary = None;
        }
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    fn summarize(&self) -> Option<Summary> {
        let (lo, hi) = self.sampler.bounding_box()?;
        let medians = self.sampler.medians()?;
        Some(Summary { lo, hi, medians })
    }

    /// Depth the anomaly score is normalised against: `2 ln(capacity)`.
    pub fn expected_depth(&self) -> f64 {
        2.0 * (self.sampler.capacity().max(2) as f64).ln()
    }

    fn depth_limit(&self) -> f64 {
        (4.0 * self.expected_depth()).ceil().max(8.0)
    }

    fn scoring_rng(&self) -> Lcg48 {
        Lcg48::new(self.seed ^ self.sampler.seen().wrapping_mul(SCORING_STREAM))
    }

    /// Number of random cuts needed to separate `query` from the reservoir.
    ///
    /// Each cut picks a dimension with probability proportional to its range
    /// in the bounding box of the surviving points and the query, then a cut
    /// value uniformly inside that range; points on the far side of the cut
    /// are discarded. If the query cannot be separated (it coincides with the
    /// survivors, or the depth limit is hit) the expected remaining depth of
    /// the survivors is added.
    pub fn isolation_depth(&self, query: &[f64]) -> f64 {
        let n = self.sampler.size();
        if n == 0 {
            return 0.0;
        }
        let dims = self.sampler.dimensions();
        let limit = self.depth_limit();
        let mut rng = self.scoring_rng();
        let mut members: Vec<usize> = (0..n).collect();

        let (mut lo, mut hi) = match &self.summary {
            Some(summary) => (summary.lo.clone(), summary.hi.clone()),
            None => match self.sampler.bounding_box() {
                Some(bounds) => bounds,
                None => return 0.0,
            },
        };

        let mut depth = 0.0;
        loop {
            for d in 0..dims {
                lo[d] = lo[d].min(query[d]);
                hi[d] = hi[d].max(query[d]);
            }
            let total: f64 = lo.iter().zip(&hi).map(|(l, h)| h - l).sum();
            if total <= 0.0 || depth >= limit {
                return depth + average_path_length(members.len());
            }

            let mut r = rng.next_double() * total;
            let mut dim = dims - 1;
            for d in 0..dims {
                let range = hi[d] - lo[d];
                if r < range {
                    dim = d;
                    break;
                }
                r -= range;
            }
            let cut = (lo[dim] + r).min(hi[dim]);
            let query_left = query[dim] <= cut;
            members.retain(|&i| (self.sampler.point(i)[dim] <= cut) == query_left);
            depth += 1.0;

            if members.is_empty() {
                return depth;
            }
            lo.iter_mut().for_each(|v| *v = f64::INFINITY);
            hi.iter_mut().for_each(|v| *v = f64::NEG_INFINITY);
            for &i in &members {
                for (d, &v) in self.sampler.point(i).iter().enumerate() {
                    lo[d] = lo[d].min(v);
                    hi[d] = hi[d].max(v);
                }
            }
        }
    }

    /// `max(0, 1 - depth / expected_depth)`; 0 for an empty reservoir.
    pub fn score(&self, query: &[f64]) -> f64 {
        if self.sampler.size() == 0 {
            return 0.0;
        }
        (1.0 - self.isolation_depth(query) / self.expected_depth()).max(0.0)
    }

    /// Reservoir median per dimension.
    pub fn medians(&self) -> Option<Vec<f64>> {
        match &self.summary {
            Some(summary) => Some(summary.medians.clone()),
            None => self.sampler.medians(),
        }
    }

    /// Accumulate the signed deviation of `query` from the reservoir medians.
    pub fn add_attribution(&self, query: &[f64], into: &mut DiVector) -> bool {
        let medians = match &self.summary {
            Some(summary) => std::borrow::Cow::Borrowed(&summary.medians),
            None => match self.sampler.medians() {
                Some(m) => std::borrow::Cow::Owned(m),
                None => return false,
            },
        };
        for (d, (&q, &m)) in query.iter().zip(medians.iter()).enumerate() {
            into.add_deviation(d, q - m);
        }
        true
    }

    /// The `k` reservoir points closest to `query` in Euclidean distance,
    /// skipping the `ignored` positions. Ties break on slot order.
    pub fn neighbors(&self, query: &[f64], k: usize, ignored: &[usize]) -> Vec<ArrayView1<'_, f64>> {
        let n = self.sampler.size();
        if n == 0 || k == 0 {
            return Vec::new();
        }
        let mut distances: Vec<(f64, usize)> = self
            .sampler
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let dist = row
                    .iter()
                    .zip(query)
                    .enumerate()
                    .filter(|(d, _)| !ignored.contains(d))
                    .map(|(_, (a, b))| (a - b) * (a - b))
                    .sum::<f64>();
                (dist, i)
            })
            .collect();
        let by_distance = |a: &(f64, usize), b: &(f64, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
        let k = k.min(n);
        if k < n {
            distances.select_nth_unstable_by(k - 1, by_distance);
            distances.truncate(k);
        }
        distances.sort_by(by_distance);
        distances
            .into_iter()
            .map(|(_, i)| self.sampler.point(i))
            .collect()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&self) -> &Lcg48 {
        &self.rng
    }

    pub fn sampler(&self) -> &ReservoirSampler {
        &self.sampler
    }
}

/// Expected isolation depth of a point among `n` points of a random tree.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let m = n as f64;
            2.0 * ((m - 1.0).ln() + EULER_GAMMA) - 2.0 * (m - 1.0) / m
        }
    }
}
