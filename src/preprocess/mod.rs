//! Turns raw observations into the feature vectors the forest scores.
//!
//! The preprocessor owns imputation of missing values, shingling,
//! time augmentation and the value transforms, together with the decayed
//! per-channel statistics those transforms rely on. Statistics are updated
//! on every observation, including those that arrive before the
//! normalization window opens, so the transform has history once it
//! switches on.

pub mod transform;

use std::collections::VecDeque;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::{DetectorConfig, ForestMode, ImputationMethod, TransformMethod};
use crate::error::{DetectorError, Result};
use crate::utils::deviation::Deviation;

/// A raw observation with its missing entries filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct Imputation {
    pub values: Vec<f64>,
    /// Number of distinct positions that were substituted.
    pub imputed: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    input_length: usize,
    shingle_size: usize,
    forest_mode: ForestMode,
    transform: TransformMethod,
    imputation: ImputationMethod,
    fill_values: Option<Vec<f64>>,
    start_normalization: u64,
    stop_normalization: u64,
    clip_factor: f64,
    time_weight: f64,
    shingle: Vec<f64>,
    imputed_slots: Vec<usize>,
    history: VecDeque<Vec<f64>>,
    values_seen: u64,
    last_transformed: bool,
    value_stats: Vec<Deviation>,
    difference_stats: Vec<Deviation>,
    gap_stats: Vec<Deviation>,
    gaps: Vec<f64>,
    last_timestamp: Option<i64>,
    imputed_total: u64,
    imputed_fraction: Deviation,
}

impl Preprocessor {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        if config.imputation_method == ImputationMethod::Next {
            return Err(DetectorError::UnsupportedImputation(ImputationMethod::Next));
        }
        let channels = config.dimensions;
        let shingle_size = config.shingle_size;
        let decay = config.effective_time_decay();
        if shingle_size == 1
            && matches!(
                config.transform_method,
                TransformMethod::Difference | TransformMethod::NormalizeDifference
            )
        {
            warn!("differencing a shingle of size 1 yields constant zero features");
        }
        Ok(Preprocessor {
            input_length: channels,
            shingle_size,
            forest_mode: config.forest_mode,
            transform: config.transform_method,
            imputation: config.imputation_method,
            fill_values: config.fill_values.clone(),
            start_normalization: config.start_normalization,
            stop_normalization: config.stop_normalization,
            clip_factor: config.clip_factor,
            time_weight: config.time_weight,
            shingle: vec![0.0; channels * shingle_size],
            imputed_slots: vec![0; shingle_size],
            history: VecDeque::with_capacity(2),
            values_seen: 0,
            last_transformed: false,
            value_stats: vec![Deviation::new(decay); channels],
            difference_stats: vec![Deviation::new(decay); channels],
            gap_stats: vec![Deviation::new(decay); shingle_size],
            gaps: vec![0.0; shingle_size],
            last_timestamp: None,
            imputed_total: 0,
            imputed_fraction: Deviation::new(decay),
        })
    }

    /// Check that restored state has the shapes `config` implies.
    pub fn check_shape(&self, config: &DetectorConfig) -> Result<()> {
        let channels = config.dimensions;
        let slots = config.shingle_size;
        let inconsistent = |what: &str, expected: usize, actual: usize| {
            Err(DetectorError::InconsistentState(format!(
                "preprocessor {what} is {actual}, expected {expected}"
            )))
        };
        if self.input_length != channels {
            return inconsistent("input length", channels, self.input_length);
        }
        if self.shingle_size != slots {
            return inconsistent("shingle size", slots, self.shingle_size);
        }
        if self.forest_mode != config.forest_mode {
            return Err(DetectorError::InconsistentState(format!(
                "preprocessor mode {:?} differs from configured {:?}",
                self.forest_mode, config.forest_mode
            )));
        }
        if self.shingle.len() != channels * slots {
            return inconsistent("shingle length", channels * slots, self.shingle.len());
        }
        for (what, len) in [
            ("imputed slot count", self.imputed_slots.len()),
            ("gap count", self.gaps.len()),
            ("gap statistics count", self.gap_stats.len()),
        ] {
            if len != slots {
                return inconsistent(what, slots, len);
            }
        }
        for (what, len) in [
            ("value statistics count", self.value_stats.len()),
            ("difference statistics count", self.difference_stats.len()),
        ] {
            if len != channels {
                return inconsistent(what, channels, len);
            }
        }
        if let Some(entry) = self.history.iter().find(|h| h.len() != channels) {
            return inconsistent("history entry length", channels, entry.len());
        }
        Ok(())
    }

    /// Fill the `missing` positions of `input` according to the configured
    /// policy. `hint` carries model-expected values for `DelegateToModel`;
    /// without it that policy uses the previous value.
    pub fn impute(&self, input: &[f64], missing: &[usize], hint: Option<&[f64]>) -> Imputation {
        let mut values = input.to_vec();
        let mut positions: Vec<usize> = missing
            .iter()
            .copied()
            .filter(|&i| i < values.len())
            .collect();
        positions.sort_unstable();
        positions.dedup();

        for &i in &positions {
            values[i] = match self.imputation {
                ImputationMethod::Zero => 0.0,
                ImputationMethod::FixedValues => self
                    .fill_values
                    .as_ref()
                    .and_then(|fill| fill.get(i).copied())
                    .unwrap_or(0.0),
                ImputationMethod::Linear => self.linear_value(i),
                ImputationMethod::DelegateToModel => match hint {
                    Some(h) if i < h.len() && h[i].is_finite() => h[i],
                    _ => self.previous_value(i),
                },
                // Next is refused in `new`
                ImputationMethod::Previous | ImputationMethod::Next => self.previous_value(i),
            };
        }
        Imputation {
            values,
            imputed: positions.len(),
        }
    }

    fn previous_value(&self, i: usize) -> f64 {
        self.history.back().map(|last| last[i]).unwrap_or(0.0)
    }

    /// Linear extrapolation from the two most recent observations.
    fn linear_value(&self, i: usize) -> f64 {
        if self.history.len() < 2 {
            return self.previous_value(i);
        }
        let before = &self.history[self.history.len() - 2];
        let last = &self.history[self.history.len() - 1];
        2.0 * last[i] - before[i]
    }

    /// Absorb one (already imputed) observation and return its feature vector.
    pub fn prepare(&mut self, input: &[f64], timestamp: i64, imputed: usize) -> Vec<f64> {
        let channels = self.input_length;
        debug_assert_eq!(input.len(), channels);

        for (c, &x) in input.iter().enumerate() {
            self.value_stats[c].update(x);
        }
        if let Some(last) = self.history.back() {
            for (c, &x) in input.iter().enumerate() {
                self.difference_stats[c].update(x - last[c]);
            }
        }

        if let Some(last_timestamp) = self.last_timestamp {
            let gap = timestamp.saturating_sub(last_timestamp) as f64;
            self.gaps.rotate_left(1);
            if let Some(newest) = self.gaps.last_mut() {
                *newest = gap;
            }
            for (stat, &g) in self.gap_stats.iter_mut().zip(&self.gaps) {
                stat.update(g);
            }
        }
        self.last_timestamp = Some(timestamp);

        self.shingle.rotate_left(channels);
        let offset = self.shingle.len() - channels;
        self.shingle[offset..].copy_from_slice(input);
        self.imputed_slots.rotate_left(1);
        if let Some(newest) = self.imputed_slots.last_mut() {
            *newest = imputed;
        }

        self.history.push_back(input.to_vec());
        if self.history.len() > 2 {
            self.history.pop_front();
        }

        self.imputed_total += imputed as u64;
        self.imputed_fraction
            .update(imputed as f64 / channels.max(1) as f64);

        self.last_transformed = self.transform_active();
        let vector = self.feature_vector();
        self.values_seen += 1;
        vector
    }

    /// The feature vector `prepare` would return, without touching any state.
    pub fn preview(&self, input: &[f64], timestamp: i64, imputed: usize) -> Vec<f64> {
        let mut staged = self.clone();
        staged.prepare(input, timestamp, imputed)
    }

    fn transform_active(&self) -> bool {
        self.transform != TransformMethod::None
            && self.values_seen >= self.start_normalization
            && self.values_seen < self.stop_normalization
    }

    fn feature_vector(&self) -> Vec<f64> {
        let mut vector = self.shingle.clone();
        if self.last_transformed {
            match self.transform {
                TransformMethod::None => {}
                TransformMethod::Normalize => {
                    transform::normalize(&mut vector, &self.value_stats, self.clip_factor)
                }
                TransformMethod::Difference => transform::difference(&mut vector, self.input_length),
                TransformMethod::NormalizeDifference => {
                    transform::difference(&mut vector, self.input_length);
                    transform::normalize(&mut vector, &self.difference_stats, self.clip_factor);
                }
            }
        }
        if self.forest_mode == ForestMode::TimeAugmented {
            vector.extend(self.time_features());
        }
        vector
    }

    /// Weighted, clipped z-scores of the shingled inter-arrival gaps; zeros
    /// until the warm-up count has been reached.
    fn time_features(&self) -> Vec<f64> {
        if self.values_seen < self.start_normalization {
            return vec![0.0; self.shingle_size];
        }
        self.gaps
            .iter()
            .zip(&self.gap_stats)
            .map(|(&gap, stat)| {
                if stat.is_empty() {
                    0.0
                } else {
                    self.time_weight * transform::z_score(gap, stat, self.clip_factor)
                }
            })
            .collect()
    }

    /// Map the newest shingle slot of a feature-space vector back to input
    /// space, undoing the transform that produced the latest feature vector.
    pub fn invert_last(&self, expected: &[f64]) -> Vec<f64> {
        let channels = self.input_length;
        let offset = (self.shingle_size - 1) * channels;
        let slot = &expected[offset..offset + channels];
        if !self.last_transformed {
            return slot.to_vec();
        }
        let preceding = if self.history.len() >= 2 {
            Some(&self.history[self.history.len() - 2])
        } else {
            None
        };
        let base = |c: usize| preceding.map(|p| p[c]).unwrap_or(0.0);

        slot.iter()
            .enumerate()
            .map(|(c, &e)| match self.transform {
                TransformMethod::None => e,
                TransformMethod::Normalize => transform::denormalize(e, &self.value_stats[c]),
                TransformMethod::Difference => base(c) + e,
                TransformMethod::NormalizeDifference => {
                    base(c) + transform::denormalize(e, &self.difference_stats[c])
                }
            })
            .collect()
    }

    /// Feature positions of raw input `indices` within the newest slot.
    pub fn newest_slot_positions(&self, indices: &[usize]) -> Vec<usize> {
        let offset = (self.shingle_size - 1) * self.input_length;
        indices.iter().map(|&i| offset + i).collect()
    }

    /// True once every shingle slot holds a real observation.
    pub fn is_shingle_full(&self) -> bool {
        self.values_seen >= self.shingle_size as u64
    }

    /// Fraction of the values in the current shingle that were imputed.
    pub fn imputed_fraction_in_shingle(&self) -> f64 {
        let total = (self.input_length * self.shingle_size).max(1);
        self.imputed_slots.iter().sum::<usize>() as f64 / total as f64
    }

    /// Decayed fraction of observed (not imputed) values, in `[0, 1]`.
    pub fn data_quality(&self) -> f64 {
        if self.imputed_fraction.is_empty() {
            return 1.0;
        }
        (1.0 - self.imputed_fraction.mean()).clamp(0.0, 1.0)
    }

    pub fn last_input(&self) -> Option<&[f64]> {
        self.history.back().map(|v| v.as_slice())
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }

    pub fn values_seen(&self) -> u64 {
        self.values_seen
    }

    pub fn imputed_total(&self) -> u64 {
        self.imputed_total
    }

    pub fn input_length(&self) -> usize {
        self.input_length
    }

    pub fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    pub fn feature_dimensions(&self) -> usize {
        let base = self.input_length * self.shingle_size;
        if self.forest_mode == ForestMode::TimeAugmented {
            base + self.shingle_size
        } else {
            base
        }
    }

    pub fn imputation_method(&self) -> ImputationMethod {
        self.imputation
    }

    /// Mean and deviation of each input channel.
    pub fn channel_statistics(&self) -> Vec<(f64, f64)> {
        self.value_stats
            .iter()
            .map(|s| (s.mean(), s.deviation()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::DetectorConfigBuilder;

    fn preprocessor(configure: impl FnOnce(DetectorConfigBuilder) -> DetectorConfigBuilder) -> Preprocessor {
        let config = configure(DetectorConfig::builder(2)).build().unwrap();
        Preprocessor::new(&config).unwrap()
    }

    #[test]
    fn shingling_slides_the_window() {
        let mut p = preprocessor(|b| b.shingle_size(3));
        assert!(!p.is_shingle_full());
        p.prepare(&[1.0, 2.0], 0, 0);
        p.prepare(&[3.0, 4.0], 1, 0);
        let v = p.prepare(&[5.0, 6.0], 2, 0);
        assert_eq!(v, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(p.is_shingle_full());
        let v = p.prepare(&[7.0, 8.0], 3, 0);
        assert_eq!(v, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn shape_check_rejects_foreign_config() {
        let config = DetectorConfig::builder(2).shingle_size(3).build().unwrap();
        let mut p = Preprocessor::new(&config).unwrap();
        p.prepare(&[1.0, 2.0], 0, 0);
        assert!(p.check_shape(&config).is_ok());

        let wider = DetectorConfig::builder(3).shingle_size(3).build().unwrap();
        let err = p.check_shape(&wider).unwrap_err();
        assert!(matches!(err, DetectorError::InconsistentState(_)));
        assert!(err.to_string().contains("input length"), "{err}");

        let longer = DetectorConfig::builder(2).shingle_size(4).build().unwrap();
        assert!(p.check_shape(&longer).is_err());

        p.history.push_back(vec![1.0]);
        assert!(p.check_shape(&config).is_err());
    }

    #[test]
    fn shingle_of_one_is_identity() {
        let mut p = preprocessor(|b| b);
        assert_eq!(p.prepare(&[1.5, -2.0], 10, 0), vec![1.5, -2.0]);
        assert_eq!(p.feature_dimensions(), 2);
    }

    #[test]
    fn normalization_waits_for_its_window() {
        let mut p = preprocessor(|b| {
            b.transform_method(TransformMethod::Normalize)
                .start_normalization(5)
                .stop_normalization(8)
        });
        for i in 0..5 {
            let v = p.prepare(&[i as f64, 100.0], i, 0);
            assert_eq!(v, vec![i as f64, 100.0], "observation {i} must pass through");
        }
        for i in 5..8 {
            let v = p.prepare(&[i as f64, 100.0], i, 0);
            assert!(v[0].abs() < 10.0 && v[0] > 0.0);
            assert!(v[1].abs() < 1e-6);
        }
        let v = p.prepare(&[8.0, 100.0], 8, 0);
        assert_eq!(v, vec![8.0, 100.0]);
    }

    #[test]
    fn difference_transform_and_inversion() {
        let mut p = preprocessor(|b| {
            b.shingle_size(2)
                .transform_method(TransformMethod::Difference)
                .start_normalization(0)
        });
        p.prepare(&[1.0, 10.0], 0, 0);
        let v = p.prepare(&[4.0, 7.0], 1, 0);
        assert_eq!(v, vec![0.0, 0.0, 3.0, -3.0]);
        let raw = p.invert_last(&[0.0, 0.0, 2.0, 1.0]);
        assert_eq!(raw, vec![3.0, 11.0]);
    }

    #[test]
    fn normalize_inversion_recovers_input() {
        let mut p = preprocessor(|b| b.transform_method(TransformMethod::Normalize).start_normalization(0));
        let mut last = Vec::new();
        for i in 0..20 {
            let input = [i as f64, (i * i) as f64 * 0.5];
            last = p.prepare(&input, i, 0);
        }
        let raw = p.invert_last(&last);
        assert!((raw[0] - 19.0).abs() < 1e-9);
        assert!((raw[1] - 180.5).abs() < 1e-9);
    }

    #[test]
    fn statistics_accumulate_before_the_window_opens() {
        let mut p = preprocessor(|b| b.transform_method(TransformMethod::Normalize).start_normalization(100));
        for i in 0..10 {
            p.prepare(&[i as f64, 1.0], i, 0);
        }
        let stats = p.channel_statistics();
        assert!(stats[0].0 > 0.0);
        assert!(stats[0].1 > 0.0);
    }

    #[test]
    fn imputation_policies() {
        let mut prev = preprocessor(|b| b);
        assert_eq!(prev.impute(&[f64::NAN, 2.0], &[0], None).values, vec![0.0, 2.0]);
        prev.prepare(&[5.0, 6.0], 0, 0);
        let filled = prev.impute(&[f64::NAN, 2.0], &[0, 0, 7], None);
        assert_eq!(filled.values, vec![5.0, 2.0]);
        assert_eq!(filled.imputed, 1);

        let zero = preprocessor(|b| b.imputation_method(ImputationMethod::Zero));
        assert_eq!(zero.impute(&[3.0, 3.0], &[1], None).values, vec![3.0, 0.0]);

        let fixed = preprocessor(|b| {
            b.imputation_method(ImputationMethod::FixedValues)
                .fill_values(vec![-1.0, -2.0])
        });
        assert_eq!(fixed.impute(&[3.0, 3.0], &[0, 1], None).values, vec![-1.0, -2.0]);

        let mut linear = preprocessor(|b| b.imputation_method(ImputationMethod::Linear));
        linear.prepare(&[1.0, 1.0], 0, 0);
        assert_eq!(linear.impute(&[0.0, 0.0], &[0], None).values[0], 1.0);
        linear.prepare(&[3.0, 1.0], 1, 0);
        assert_eq!(linear.impute(&[0.0, 0.0], &[0], None).values[0], 5.0);

        let mut model = preprocessor(|b| b.imputation_method(ImputationMethod::DelegateToModel));
        model.prepare(&[9.0, 9.0], 0, 0);
        assert_eq!(model.impute(&[0.0, 0.0], &[1], None).values[1], 9.0);
        assert_eq!(model.impute(&[0.0, 0.0], &[1], Some(&[0.0, 4.0])).values[1], 4.0);
    }

    #[test]
    fn time_augmentation_appends_gap_features() {
        let mut p = preprocessor(|b| {
            b.shingle_size(2)
                .forest_mode(ForestMode::TimeAugmented)
                .start_normalization(3)
        });
        assert_eq!(p.feature_dimensions(), 6);
        let early = p.prepare(&[1.0, 1.0], 0, 0);
        assert_eq!(early.len(), 6);
        assert_eq!(&early[4..], &[0.0, 0.0]);
        for i in 1..20 {
            p.prepare(&[1.0, 1.0], i * 10, 0);
        }
        let late = p.prepare(&[1.0, 1.0], 1000, 0);
        assert_eq!(late.len(), 6);
        assert!(late[5] > 1.0, "a long gap should stand out: {}", late[5]);
    }

    #[test]
    fn preview_leaves_state_untouched() {
        let mut p = preprocessor(|b| b.shingle_size(2));
        p.prepare(&[1.0, 1.0], 0, 0);
        let before = p.clone();
        let previewed = p.preview(&[2.0, 2.0], 1, 0);
        assert_eq!(p, before);
        assert_eq!(previewed, p.prepare(&[2.0, 2.0], 1, 0));
    }

    #[test]
    fn data_quality_tracks_imputation() {
        let mut p = preprocessor(|b| b.shingle_size(2));
        assert_eq!(p.data_quality(), 1.0);
        p.prepare(&[1.0, 1.0], 0, 1);
        p.prepare(&[1.0, 1.0], 1, 0);
        assert_eq!(p.imputed_total(), 1);
        assert!((p.imputed_fraction_in_shingle() - 0.25).abs() < 1e-12);
        assert!(p.data_quality() < 1.0);
        p.prepare(&[1.0, 1.0], 2, 0);
        assert_eq!(p.imputed_fraction_in_shingle(), 0.0);
    }

    #[test]
    fn next_is_refused() {
        let config = DetectorConfig {
            imputation_method: ImputationMethod::Next,
            ..DetectorConfig::default()
        };
        assert!(Preprocessor::new(&config).is_err());
    }
}
