use serde::{Deserialize, Serialize};

/// Per-dimension attribution split into the part above and below the
/// model's reference point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiVector {
    pub high: Vec<f64>,
    pub low: Vec<f64>,
}

impl DiVector {
    pub fn zeros(dimensions: usize) -> Self {
        DiVector {
            high: vec![0.0; dimensions],
            low: vec![0.0; dimensions],
        }
    }

    pub fn dimensions(&self) -> usize {
        self.high.len()
    }

    /// Add a signed deviation to dimension `d`.
    pub fn add_deviation(&mut self, d: usize, deviation: f64) {
        if deviation > 0.0 {
            self.high[d] += deviation;
        } else {
            self.low[d] -= deviation;
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.high.iter_mut().for_each(|v| *v *= factor);
        self.low.iter_mut().for_each(|v| *v *= factor);
    }

    /// high + low for dimension `d`.
    pub fn total(&self, d: usize) -> f64 {
        self.high[d] + self.low[d]
    }

    /// Sum over all dimensions.
    pub fn magnitude(&self) -> f64 {
        self.high.iter().chain(self.low.iter()).sum()
    }
}

/// What a backend reports for one query vector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDescriptor {
    pub score: f64,
    pub expected_point: Option<Vec<f64>>,
    pub attribution: Option<DiVector>,
}

impl ScoreDescriptor {
    /// The sentinel reported while a backend is still warming up.
    pub fn empty() -> Self {
        ScoreDescriptor::default()
    }
}

/// A streaming scorer the detector can drive.
///
/// The orchestrator and the corrector only ever talk to this trait, so any
/// backend honouring it can stand in for the built-in forest. Scoring must
/// not change the backend; all learning happens in `update`.
pub trait ScoringBackend {
    /// Score one feature vector against the current model.
    fn score(&self, point: &[f64]) -> ScoreDescriptor;

    /// Incorporate one feature vector.
    fn update(&mut self, point: &[f64]);

    /// Expected values for `positions` given the rest of `point`.
    fn impute(&self, _point: &[f64], _positions: &[usize]) -> Option<Vec<f64>> {
        None
    }

    fn total_updates(&self) -> u64;

    fn shingle_size(&self) -> usize;

    /// Length of the feature vectors this backend accepts.
    fn dimensions(&self) -> usize;

    /// Default: ready as soon as anything has been seen.
    fn is_output_ready(&self) -> bool {
        self.total_updates() > 0
    }

    fn cache_fraction(&self) -> f64 {
        1.0
    }

    fn set_cache_fraction(&mut self, _fraction: f64) {}
}
