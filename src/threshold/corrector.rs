use std::collections::VecDeque;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::config::{DetectorConfig, ScoringStrategy};
use crate::detector::AnomalyDescriptor;
use crate::models::base_model::{ScoreDescriptor, ScoringBackend};
use crate::threshold::thresholder::{BasicThresholder, ThresholdMode};

/// Average relative change of the expected point above which a grade is
/// discounted as a likely regime change.
const DRIFT_TOLERANCE: f64 = 0.1;
const MINIMUM_DRIFT_FACTOR: f64 = 0.5;
const RELATIVE_EPSILON: f64 = 1e-9;

/// Per-point thresholding plus the corrections applied on top of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictorCorrector {
    thresholder: BasicThresholder,
    strategy: ScoringStrategy,
    auto_adjust: bool,
    noise_factor: f64,
    ignore_absolute: f64,
    ignore_ratio: f64,
    allowed_noise_run: usize,
    run_length: usize,
    score_history: usize,
    recent_scores: VecDeque<f64>,
}

impl PredictorCorrector {
    pub fn new(config: &DetectorConfig) -> Self {
        let thresholder = BasicThresholder::new(config.anomaly_rate)
            .with_z_factor(config.z_factor)
            .with_thresholds(config.initial_threshold, config.absolute_threshold)
            .with_minimum_scores(config.minimum_scores)
            .with_score_differencing(config.score_differencing);
        PredictorCorrector {
            thresholder,
            strategy: config.scoring_strategy,
            auto_adjust: config.auto_adjust,
            noise_factor: config.noise_factor,
            ignore_absolute: config.ignore_near_expected_absolute,
            ignore_ratio: config.ignore_near_expected_ratio,
            allowed_noise_run: config.allowed_noise_run,
            run_length: 0,
            score_history: config.score_history,
            recent_scores: VecDeque::with_capacity(config.score_history),
        }
    }

    /// The estimator whose threshold is reported on output records.
    fn reporting_mode(&self) -> ThresholdMode {
        match self.strategy {
            ScoringStrategy::Distance => ThresholdMode::Distance,
            _ => ThresholdMode::ExpectedInverseDepth,
        }
    }

    /// Threshold currently reported for the configured strategy.
    pub fn threshold(&self) -> f64 {
        self.thresholder.threshold(self.reporting_mode())
    }

    /// Fill in score, threshold, grade and confidence of `record` from the
    /// backend's `descriptor` for `feature`, then update the thresholds.
    ///
    /// `record.expected_values` must already hold the expected point in
    /// input space; noise suppression and drift correction compare against
    /// it. Threshold statistics only move once the backend reports ready.
    pub fn process<B: ScoringBackend + ?Sized>(
        &mut self,
        record: &mut AnomalyDescriptor,
        descriptor: &ScoreDescriptor,
        feature: &[f64],
        backend: &B,
        last_anomaly: Option<&AnomalyDescriptor>,
    ) {
        let score = descriptor.score;
        let distance = descriptor
            .expected_point
            .as_deref()
            .map(|expected| euclidean_distance(feature, expected))
            .unwrap_or(0.0);
        record.score = score;
        record.distance = distance;
        record.expected_point = descriptor.expected_point.clone();
        record.attribution = descriptor.attribution.clone();

        let mode = self.reporting_mode();
        let reported = match mode {
            ThresholdMode::Distance => distance,
            ThresholdMode::ExpectedInverseDepth => score,
        };
        record.threshold = self.thresholder.threshold(mode);

        if !backend.is_output_ready() {
            record.grade = 0.0;
            self.run_length = 0;
            return;
        }

        let mut grade = match self.strategy {
            ScoringStrategy::ExpectedInverseDepth => {
                self.thresholder.grade(score, ThresholdMode::ExpectedInverseDepth)
            }
            ScoringStrategy::Distance => self.thresholder.grade(distance, ThresholdMode::Distance),
            ScoringStrategy::MultiMode => {
                let depth = self.thresholder.grade(score, ThresholdMode::ExpectedInverseDepth);
                let confirmed = self.thresholder.grade(distance, ThresholdMode::Distance) > 0.0;
                if confirmed {
                    depth
                } else {
                    0.0
                }
            }
        };

        if self.thresholder.is_ready(mode) {
            let stats = self.thresholder.statistics(mode);
            let spread = stats.deviation.max(RELATIVE_EPSILON);
            record.confidence = Some(((reported - stats.mean).abs() / spread).min(1.0));
        }

        if grade > 0.0 && self.auto_adjust && self.is_noise(record) {
            trace!(
                "suppressing grade {grade:.4} near expected values (run length {})",
                self.run_length
            );
            grade *= self.noise_factor;
        }
        if grade > 0.0 {
            if let Some(factor) = drift_factor(record, last_anomaly) {
                trace!("discounting grade {grade:.4} by drift factor {factor:.4}");
                grade *= factor;
            }
        }
        record.grade = grade.clamp(0.0, 1.0);

        if record.grade > 0.0 {
            self.run_length += 1;
        } else {
            self.run_length = 0;
        }

        match self.strategy {
            ScoringStrategy::ExpectedInverseDepth => {
                self.thresholder.update(score, ThresholdMode::ExpectedInverseDepth)
            }
            ScoringStrategy::Distance => self.thresholder.update(distance, ThresholdMode::Distance),
            ScoringStrategy::MultiMode => {
                self.thresholder.update(score, ThresholdMode::ExpectedInverseDepth);
                self.thresholder.update(distance, ThresholdMode::Distance);
            }
        }
        self.remember(score);
    }

    /// True when every value lies within the ignore band around its
    /// expectation and the current anomaly run is still short.
    fn is_noise(&self, record: &AnomalyDescriptor) -> bool {
        if self.run_length >= self.allowed_noise_run {
            return false;
        }
        let expected = match &record.expected_values {
            Some(expected) => expected,
            None => return false,
        };
        record.input.iter().zip(expected).all(|(&actual, &e)| {
            let gap = (actual - e).abs();
            gap <= self.ignore_absolute || gap <= self.ignore_ratio * e.abs()
        })
    }

    fn remember(&mut self, score: f64) {
        if self.score_history == 0 {
            return;
        }
        if self.recent_scores.len() == self.score_history {
            self.recent_scores.pop_front();
        }
        self.recent_scores.push_back(score);
    }

    /// Number of consecutive points with a positive grade.
    pub fn run_length(&self) -> usize {
        self.run_length
    }

    /// Most recent raw scores, oldest first.
    pub fn recent_scores(&self) -> impl Iterator<Item = f64> + '_ {
        self.recent_scores.iter().copied()
    }

    pub fn thresholder(&self) -> &BasicThresholder {
        &self.thresholder
    }

    pub fn thresholder_mut(&mut self) -> &mut BasicThresholder {
        &mut self.thresholder
    }
}

/// Grade multiplier for a shift of the expected point since the last
/// accepted anomaly, or `None` when there is nothing to compare.
fn drift_factor(record: &AnomalyDescriptor, last_anomaly: Option<&AnomalyDescriptor>) -> Option<f64> {
    let current = record.expected_values.as_ref()?;
    let previous = last_anomaly?.expected_values.as_ref()?;
    if current.is_empty() || current.len() != previous.len() {
        return None;
    }
    let drift = current
        .iter()
        .zip(previous)
        .map(|(&c, &p)| (c - p).abs() / p.abs().max(RELATIVE_EPSILON))
        .sum::<f64>()
        / current.len() as f64;
    if drift > DRIFT_TOLERANCE {
        Some((1.0 - drift).max(MINIMUM_DRIFT_FACTOR))
    } else {
        None
    }
}

fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend with a fixed readiness, enough to drive the corrector.
    struct Stub {
        ready: bool,
    }

    impl ScoringBackend for Stub {
        fn score(&self, _point: &[f64]) -> ScoreDescriptor {
            ScoreDescriptor::empty()
        }
        fn update(&mut self, _point: &[f64]) {}
        fn total_updates(&self) -> u64 {
            0
        }
        fn shingle_size(&self) -> usize {
            1
        }
        fn dimensions(&self) -> usize {
            1
        }
        fn is_output_ready(&self) -> bool {
            self.ready
        }
    }

    const READY: Stub = Stub { ready: true };

    fn corrector(configure: impl FnOnce(&mut DetectorConfig)) -> PredictorCorrector {
        let mut config = DetectorConfig {
            minimum_scores: 5,
            ..DetectorConfig::default()
        };
        configure(&mut config);
        PredictorCorrector::new(&config)
    }

    fn descriptor(score: f64, expected: f64) -> ScoreDescriptor {
        ScoreDescriptor {
            score,
            expected_point: Some(vec![expected]),
            attribution: None,
        }
    }

    fn record(input: f64, expected: f64) -> AnomalyDescriptor {
        AnomalyDescriptor {
            input: vec![input],
            expected_values: Some(vec![expected]),
            ..AnomalyDescriptor::default()
        }
    }

    fn warm_up(c: &mut PredictorCorrector, n: usize) {
        for i in 0..n {
            let mut r = record(1.0, 1.0);
            let s = 0.1 + 0.01 * (i % 3) as f64;
            c.process(&mut r, &descriptor(s, 1.0), &[1.0], &READY, None);
        }
    }

    #[test]
    fn silent_while_backend_warms_up() {
        let mut c = corrector(|_| {});
        let mut r = record(1.0, 1.0);
        c.process(&mut r, &descriptor(0.9, 1.0), &[1.0], &Stub { ready: false }, None);
        assert_eq!(r.grade, 0.0);
        assert_eq!(r.threshold, 1.0);
        assert_eq!(c.thresholder().count(), 0);
        assert_eq!(c.recent_scores().count(), 0);
    }

    #[test]
    fn high_score_is_graded_and_run_length_tracks() {
        let mut c = corrector(|_| {});
        warm_up(&mut c, 40);
        let mut r = record(9.0, 1.0);
        c.process(&mut r, &descriptor(0.95, 1.0), &[9.0], &READY, None);
        assert!(r.grade > 0.0);
        assert_eq!(r.confidence, Some(1.0));
        assert_eq!(c.run_length(), 1);
        let mut r = record(1.0, 1.0);
        c.process(&mut r, &descriptor(0.1, 1.0), &[1.0], &READY, None);
        assert_eq!(r.grade, 0.0);
        assert_eq!(c.run_length(), 0);
    }

    #[test]
    fn noise_is_damped_only_for_short_runs() {
        let mut c = corrector(|config| {
            config.auto_adjust = true;
            config.ignore_near_expected_absolute = 0.5;
            config.noise_factor = 0.25;
            config.allowed_noise_run = 1;
        });
        warm_up(&mut c, 40);
        let mut loud = corrector(|_| {});
        warm_up(&mut loud, 40);

        let mut damped = record(1.2, 1.0);
        c.process(&mut damped, &descriptor(0.2, 1.0), &[1.2], &READY, None);
        let mut plain = record(1.2, 1.0);
        loud.process(&mut plain, &descriptor(0.2, 1.0), &[1.2], &READY, None);
        assert!(plain.grade > 0.0);
        assert!((damped.grade - 0.25 * plain.grade).abs() < 1e-12);

        // the run has reached the allowed length, so the next one stands
        let mut second = record(1.2, 1.0);
        c.process(&mut second, &descriptor(0.2, 1.0), &[1.2], &READY, None);
        assert!(second.grade > damped.grade);
    }

    #[test]
    fn drift_discounts_grade() {
        let mut c = corrector(|_| {});
        warm_up(&mut c, 40);
        let mut reference = corrector(|_| {});
        warm_up(&mut reference, 40);

        let previous = record(5.0, 1.0);
        let mut drifted = record(9.0, 1.2);
        c.process(&mut drifted, &descriptor(0.3, 1.2), &[9.0], &READY, Some(&previous));
        let mut steady = record(9.0, 1.2);
        reference.process(&mut steady, &descriptor(0.3, 1.2), &[9.0], &READY, None);
        assert!(steady.grade > 0.0);
        // 20% drift -> factor 0.8
        assert!((drifted.grade - 0.8 * steady.grade).abs() < 1e-12);
    }

    #[test]
    fn multi_mode_needs_distance_confirmation() {
        let mut c = corrector(|config| config.scoring_strategy = ScoringStrategy::MultiMode);
        warm_up(&mut c, 40);
        // high depth score but the point sits on its expectation
        let mut r = record(1.0, 1.0);
        c.process(&mut r, &descriptor(0.95, 1.0), &[1.0], &READY, None);
        assert_eq!(r.grade, 0.0);
        let mut r = record(9.0, 1.0);
        c.process(&mut r, &descriptor(0.95, 1.0), &[9.0], &READY, None);
        assert!(r.grade > 0.0);
        assert!((r.distance - 8.0).abs() < 1e-12);
    }

    #[test]
    fn distance_strategy_grades_on_distance_alone() {
        let mut c = corrector(|config| config.scoring_strategy = ScoringStrategy::Distance);
        for i in 0..40 {
            let x = 1.0 + 0.01 * (i % 3) as f64;
            let mut r = record(x, 1.0);
            c.process(&mut r, &descriptor(0.1, 1.0), &[x], &READY, None);
            assert_eq!(r.grade, 0.0);
        }
        assert!(c.thresholder().is_ready(ThresholdMode::Distance));
        assert_eq!(c.thresholder().statistics(ThresholdMode::ExpectedInverseDepth).count, 0);
        assert_eq!(c.threshold(), c.thresholder().threshold(ThresholdMode::Distance));

        // a high depth score on a point sitting at its expectation is ignored
        let mut quiet = record(1.0, 1.0);
        c.process(&mut quiet, &descriptor(0.95, 1.0), &[1.0], &READY, None);
        assert_eq!(quiet.grade, 0.0);

        let mut far = record(9.0, 1.0);
        c.process(&mut far, &descriptor(0.1, 1.0), &[9.0], &READY, None);
        assert!(far.grade > 0.0);
        assert!((far.distance - 8.0).abs() < 1e-12);
        assert!(far.distance > far.threshold);
        assert!(far.threshold < 0.1, "threshold {}", far.threshold);
    }

    #[test]
    fn recent_scores_are_bounded() {
        let mut c = corrector(|config| config.score_history = 4);
        warm_up(&mut c, 10);
        let scores: Vec<f64> = c.recent_scores().collect();
        assert_eq!(scores.len(), 4);
        assert_eq!(scores[3], 0.1);
    }
}
