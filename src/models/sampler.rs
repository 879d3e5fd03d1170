use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::utils::random::Lcg48;

/// Bounded uniform sample of a point stream.
///
/// Points live in a preallocated `capacity x dimensions` matrix. With a zero
/// time decay this is classic reservoir sampling: once full, the n-th point
/// overwrites a uniformly chosen slot with probability `capacity / n`, so
/// every point seen so far is retained with the same probability. A positive
/// decay switches to priority sampling with weights
/// `-decay * sequence + ln(-ln u)`, keeping the smallest weights, which biases
/// the sample towards recent points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReservoirSampler {
    capacity: usize,
    dimensions: usize,
    time_decay: f64,
    points: Array2<f64>,
    weights: Vec<f64>,
    size: usize,
    seen: u64,
}

impl ReservoirSampler {
    pub fn new(capacity: usize, dimensions: usize, time_decay: f64) -> Self {
        ReservoirSampler {
            capacity,
            dimensions,
            time_decay: time_decay.max(0.0),
            points: Array2::zeros((capacity, dimensions)),
            weights: Vec::with_capacity(capacity),
            size: 0,
            seen: 0,
        }
    }

    /// Rebuild a sampler from stored parts. Rows past `size` are ignored.
    pub(crate) fn from_parts(
        points: Array2<f64>,
        weights: Vec<f64>,
        size: usize,
        seen: u64,
        time_decay: f64,
    ) -> Self {
        let (capacity, dimensions) = points.dim();
        ReservoirSampler {
            capacity,
            dimensions,
            time_decay,
            points,
            weights,
            size: size.min(capacity),
            seen,
        }
    }

    /// Offer a point to the reservoir. Returns the slot it was written to,
    /// or `None` when the point was not retained.
    pub fn accept(&mut self, point: &[f64], rng: &mut Lcg48) -> Option<usize> {
        debug_assert_eq!(point.len(), self.dimensions);
        self.seen += 1;

        if self.time_decay > 0.0 {
            return self.accept_weighted(point, rng);
        }

        if self.size < self.capacity {
            let slot = self.size;
            self.write(slot, point, 0.0);
            self.size += 1;
            return Some(slot);
        }

        let slot = rng.next_index(self.seen) as usize;
        if slot < self.capacity {
            self.write(slot, point, 0.0);
            Some(slot)
        } else {
            None
        }
    }

    fn accept_weighted(&mut self, point: &[f64], rng: &mut Lcg48) -> Option<usize> {
        let mut u = rng.next_double();
        if u <= 0.0 {
            u = f64::MIN_POSITIVE;
        }
        let weight = -self.time_decay * self.seen as f64 + (-u.ln()).ln();

        if self.size < self.capacity {
            let slot = self.size;
            self.write(slot, point, weight);
            self.size += 1;
            return Some(slot);
        }

        let (slot, heaviest) = self
            .weights
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best, max), (i, &w)| {
                if w > max {
                    (i, w)
                } else {
                    (best, max)
                }
            });
        if weight < heaviest {
            self.write(slot, point, weight);
            Some(slot)
        } else {
            None
        }
    }

    fn write(&mut self, slot: usize, point: &[f64], weight: f64) {
        self.points
            .row_mut(slot)
            .iter_mut()
            .zip(point)
            .for_each(|(dst, &src)| *dst = src);
        if slot < self.weights.len() {
            self.weights[slot] = weight;
        } else {
            self.weights.push(weight);
        }
    }

    pub fn point(&self, index: usize) -> ArrayView1<'_, f64> {
        self.points.row(index)
    }

    /// Iterator over the occupied rows.
    pub fn iter(&self) -> impl Iterator<Item = ArrayView1<'_, f64>> + '_ {
        self.points.outer_iter().take(self.size)
    }

    /// Componentwise min and max over the occupied rows.
    pub fn bounding_box(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        if self.size == 0 {
            return None;
        }
        let mut lo = vec![f64::INFINITY; self.dimensions];
        let mut hi = vec![f64::NEG_INFINITY; self.dimensions];
        for row in self.iter() {
            for (d, &v) in row.iter().enumerate() {
                lo[d] = lo[d].min(v);
                hi[d] = hi[d].max(v);
            }
        }
        Some((lo, hi))
    }

    /// Per-dimension median of the occupied rows.
    pub fn medians(&self) -> Option<Vec<f64>> {
        if self.size == 0 {
            return None;
        }
        let mut column = Vec::with_capacity(self.size);
        let medians = (0..self.dimensions)
            .map(|d| {
                column.clear();
                column.extend(self.iter().map(|row| row[d]));
                median_in_place(&mut column)
            })
            .collect();
        Some(medians)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn is_full(&self) -> bool {
        self.size == self.capacity
    }

    pub fn time_decay(&self) -> f64 {
        self.time_decay
    }

    pub(crate) fn points(&self) -> &Array2<f64> {
        &self.points
    }

    pub(crate) fn weights(&self) -> &[f64] {
        &self.weights
    }
}

/// Median of a non-empty slice; reorders the slice.
pub(crate) fn median_in_place(values: &mut [f64]) -> f64 {
    let n = values.len();
    let mid = n / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower = values[..mid]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        (lower + upper) / 2.0
    }
}
