use log::debug;
use serde::{Deserialize, Serialize};

use crate::utils::deviation::Deviation;

/// Floor on the z-factor; smaller multipliers make thresholds oversensitive.
pub const MINIMUM_Z_FACTOR: f64 = 2.0;

const GRADE_EPSILON: f64 = 1e-10;

/// Which score stream a threshold refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdMode {
    /// Forest (inverse isolation depth) scores.
    ExpectedInverseDepth,
    /// Distances to the expected point.
    Distance,
}

/// Mean and deviation of the estimator behind a mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreStatistics {
    pub mean: f64,
    pub deviation: f64,
    pub count: u64,
}

/// Dynamic threshold over a score stream.
///
/// Depth scores feed the primary estimator and, through their successive
/// differences, the secondary one. Distance scores feed their own
/// estimator. Until a mode has seen `minimum_scores` values the threshold
/// is the fixed initial one; after that the statistical threshold
/// `mean + z * deviation` is blended in over another `minimum_scores`
/// values, and never reported below the absolute floor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicThresholder {
    primary: Deviation,
    secondary: Deviation,
    threshold_deviation: Deviation,
    count: u64,
    last_score: Option<f64>,
    z_factor: f64,
    initial_threshold: f64,
    absolute_threshold: f64,
    minimum_scores: u64,
    score_differencing: f64,
}

impl BasicThresholder {
    pub fn new(discount: f64) -> Self {
        BasicThresholder {
            primary: Deviation::new(discount),
            secondary: Deviation::new(discount),
            threshold_deviation: Deviation::new(discount),
            count: 0,
            last_score: None,
            z_factor: 3.0,
            initial_threshold: 1.0,
            absolute_threshold: 0.0,
            minimum_scores: 10,
            score_differencing: 0.0,
        }
    }

    pub fn with_z_factor(mut self, z_factor: f64) -> Self {
        self.set_z_factor(z_factor);
        self
    }

    /// The initial threshold is raised to the absolute floor if needed.
    pub fn with_thresholds(mut self, initial: f64, absolute: f64) -> Self {
        self.absolute_threshold = absolute.max(0.0);
        self.initial_threshold = initial.max(self.absolute_threshold);
        self
    }

    pub fn with_minimum_scores(mut self, minimum: u64) -> Self {
        self.minimum_scores = minimum.max(1);
        self
    }

    pub fn with_score_differencing(mut self, weight: f64) -> Self {
        self.score_differencing = weight.clamp(0.0, 1.0);
        self
    }

    pub fn set_z_factor(&mut self, z_factor: f64) {
        self.z_factor = z_factor.max(MINIMUM_Z_FACTOR);
    }

    pub fn z_factor(&self) -> f64 {
        self.z_factor
    }

    pub fn initial_threshold(&self) -> f64 {
        self.initial_threshold
    }

    pub fn absolute_threshold(&self) -> f64 {
        self.absolute_threshold
    }

    /// Total number of updates across both modes.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn update(&mut self, score: f64, mode: ThresholdMode) {
        match mode {
            ThresholdMode::ExpectedInverseDepth => {
                if let Some(last) = self.last_score {
                    self.secondary.update(score - last);
                }
                self.primary.update(score);
                self.last_score = Some(score);
                if self.primary.count() == self.minimum_scores {
                    debug!("thresholder ready after {} depth scores", self.minimum_scores);
                }
            }
            ThresholdMode::Distance => self.threshold_deviation.update(score),
        }
        self.count += 1;
    }

    fn estimator(&self, mode: ThresholdMode) -> &Deviation {
        match mode {
            ThresholdMode::ExpectedInverseDepth => &self.primary,
            ThresholdMode::Distance => &self.threshold_deviation,
        }
    }

    fn differencing_active(&self, mode: ThresholdMode) -> bool {
        mode == ThresholdMode::ExpectedInverseDepth && self.score_differencing > 0.0
    }

    pub fn is_ready(&self, mode: ThresholdMode) -> bool {
        let primary_ready = self.estimator(mode).count() >= self.minimum_scores;
        if self.differencing_active(mode) {
            primary_ready && self.secondary.count() >= self.minimum_scores
        } else {
            primary_ready
        }
    }

    /// 0 below the minimum count, rising linearly to 1 at twice the minimum.
    pub fn ramp_fraction(&self, mode: ThresholdMode) -> f64 {
        let count = self.estimator(mode).count();
        if count < self.minimum_scores {
            return 0.0;
        }
        ((count - self.minimum_scores) as f64 / self.minimum_scores as f64).min(1.0)
    }

    pub fn threshold(&self, mode: ThresholdMode) -> f64 {
        if !self.is_ready(mode) {
            return self.initial_threshold;
        }
        let estimator = self.estimator(mode);
        let mut statistical = estimator.mean() + self.z_factor * estimator.deviation();
        if self.differencing_active(mode) {
            let differenced = estimator.mean()
                + self.secondary.mean()
                + self.z_factor * self.secondary.deviation();
            statistical = (1.0 - self.score_differencing) * statistical
                + self.score_differencing * differenced;
        }
        let ramp = self.ramp_fraction(mode);
        let blended = ramp * statistical + (1.0 - ramp) * self.initial_threshold;
        blended.max(self.absolute_threshold)
    }

    /// Fractional standard deviations above the threshold, capped at 1.
    pub fn grade(&self, score: f64, mode: ThresholdMode) -> f64 {
        let threshold = self.threshold(mode);
        self.grade_against(score, threshold, mode)
    }

    pub(crate) fn grade_against(&self, score: f64, threshold: f64, mode: ThresholdMode) -> f64 {
        if !(score > threshold) {
            return 0.0;
        }
        let deviation = self.estimator(mode).deviation();
        ((score - threshold) / (deviation + GRADE_EPSILON)).min(1.0)
    }

    pub fn statistics(&self, mode: ThresholdMode) -> ScoreStatistics {
        let estimator = self.estimator(mode);
        ScoreStatistics {
            mean: estimator.mean(),
            deviation: estimator.deviation(),
            count: estimator.count(),
        }
    }

    pub fn secondary_statistics(&self) -> ScoreStatistics {
        ScoreStatistics {
            mean: self.secondary.mean(),
            deviation: self.secondary.deviation(),
            count: self.secondary.count(),
        }
    }
}
