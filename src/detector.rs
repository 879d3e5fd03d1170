//! The public entry point: preprocessor, forest and corrector wired together.

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, DetectorState, ForestState};
use crate::config::{DetectorConfig, ForestMode, ImputationMethod};
use crate::error::{DetectorError, Result};
use crate::models::base_model::{DiVector, ScoringBackend};
use crate::models::forest::RandomCutForest;
use crate::preprocess::{Imputation, Preprocessor};
use crate::threshold::corrector::PredictorCorrector;

/// Everything the detector reports for one observation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDescriptor {
    /// The observation as scored, with missing values filled in.
    pub input: Vec<f64>,
    pub timestamp: i64,
    /// Forest score in `[0, 1]`.
    pub score: f64,
    /// Distance between the feature vector and the forest's expected point.
    pub distance: f64,
    pub threshold: f64,
    /// Anomaly grade in `[0, 1]`.
    pub grade: f64,
    pub confidence: Option<f64>,
    /// Expected feature vector, as reported by the forest.
    pub expected_point: Option<Vec<f64>>,
    /// Expected observation, mapped back into input space.
    pub expected_values: Option<Vec<f64>>,
    pub attribution: Option<DiVector>,
    pub missing_indices: Vec<usize>,
    pub imputed_count: usize,
    /// Observations processed by the detector, this one included.
    pub total_updates: u64,
    pub data_quality: f64,
}

impl AnomalyDescriptor {
    pub fn is_anomaly(&self) -> bool {
        self.grade > 0.0
    }
}

/// Streaming anomaly detector over fixed-length observations.
///
/// Calls must be serialized per instance; the detector mutates its backend,
/// preprocessor statistics and thresholds in place on every observation.
/// The scoring backend defaults to the built-in [`RandomCutForest`]; any
/// other [`ScoringBackend`] can be supplied through [`Self::with_backend`].
#[derive(Clone, Debug)]
pub struct ThresholdedRandomCutForest<B = RandomCutForest> {
    config: DetectorConfig,
    backend: B,
    preprocessor: Preprocessor,
    corrector: PredictorCorrector,
    last_anomaly: Option<AnomalyDescriptor>,
    total_updates: u64,
}

impl ThresholdedRandomCutForest<RandomCutForest> {
    /// Build a detector on the built-in forest. A missing seed is drawn once
    /// and written back into the configuration, so `config()` always
    /// describes a reproducible run.
    pub fn new(mut config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let seed = *config.random_seed.get_or_insert_with(rand::random::<u64>);
        let forest = RandomCutForest::new(
            config.feature_dimensions(),
            config.shingle_size,
            config.number_of_trees,
            config.sample_size,
            config.sampler_time_decay,
            config.effective_output_after(),
            config.neighbor_count,
            seed,
        );
        info!(
            "forest: {} trees, sample size {}, sampler decay {}, seed {seed}",
            config.number_of_trees, config.sample_size, config.sampler_time_decay
        );
        Self::with_backend(config, forest)
    }

    pub fn forest(&self) -> &RandomCutForest {
        &self.backend
    }

    /// Full model state, detached from the live detector.
    pub fn state(&self) -> DetectorState {
        DetectorState {
            config: self.config.clone(),
            forest: ForestState::capture(&self.backend, false),
            preprocessor: self.preprocessor.clone(),
            corrector: self.corrector.clone(),
            last_anomaly: self.last_anomaly.clone(),
            total_updates: self.total_updates,
        }
    }

    /// Rebuild a detector from captured state. The configuration and every
    /// captured shape are checked before anything is rebuilt.
    pub fn from_state(state: DetectorState) -> Result<Self> {
        state.check()?;
        Ok(ThresholdedRandomCutForest {
            backend: state.forest.restore(),
            config: state.config,
            preprocessor: state.preprocessor,
            corrector: state.corrector,
            last_anomaly: state.last_anomaly,
            total_updates: state.total_updates,
        })
    }

    /// Framed checkpoint of the full model.
    ///
    /// With `compress`, reservoir points are stored in single precision.
    /// That is lossy: a detector restored from a compressed checkpoint
    /// scores slightly differently from the one that wrote it. Only an
    /// uncompressed checkpoint resumes bit for bit.
    pub fn to_checkpoint(&self, compress: bool) -> Result<Vec<u8>> {
        let mut state = self.state();
        if compress {
            state.forest = ForestState::capture(&self.backend, true);
        }
        checkpoint::encode(&state, compress)
    }

    /// Rebuild a detector from `to_checkpoint` output. Fails without
    /// touching anything if the frame or payload does not check out.
    pub fn from_checkpoint(bytes: &[u8]) -> Result<Self> {
        let state = checkpoint::decode(bytes)?;
        Self::from_state(state)
    }
}

impl<B: ScoringBackend> ThresholdedRandomCutForest<B> {
    /// Build a detector around a caller-supplied backend. The backend must
    /// accept feature vectors of `config.feature_dimensions()` and shingle
    /// like the configuration does.
    pub fn with_backend(config: DetectorConfig, mut backend: B) -> Result<Self> {
        config.validate()?;
        let expected = config.feature_dimensions();
        if backend.dimensions() != expected {
            return Err(DetectorError::InvalidConfig(format!(
                "backend accepts {} features, configuration implies {expected}",
                backend.dimensions()
            )));
        }
        if backend.shingle_size() != config.shingle_size {
            return Err(DetectorError::InvalidConfig(format!(
                "backend shingle size {} differs from configured {}",
                backend.shingle_size(),
                config.shingle_size
            )));
        }
        let preprocessor = Preprocessor::new(&config)?;
        backend.set_cache_fraction(config.bounding_box_cache_fraction);
        let corrector = PredictorCorrector::new(&config);
        info!(
            "detector: {} dims x shingle {} ({} features), {:?}/{:?}/{:?}",
            config.dimensions,
            config.shingle_size,
            expected,
            config.forest_mode,
            config.transform_method,
            config.scoring_strategy
        );
        Ok(ThresholdedRandomCutForest {
            config,
            backend,
            preprocessor,
            corrector,
            last_anomaly: None,
            total_updates: 0,
        })
    }

    /// Score one observation and learn from it.
    ///
    /// `missing` lists positions of `point` whose values are unknown; their
    /// contents are ignored and replaced according to the imputation policy.
    pub fn process(&mut self, point: &[f64], timestamp: i64, missing: &[i32]) -> Result<AnomalyDescriptor> {
        let missing = self.validate_point(point, missing)?;
        if let Some(last) = self.preprocessor.last_timestamp() {
            if timestamp <= last {
                warn!("timestamp {timestamp} does not advance past {last}");
            }
        }
        Ok(self.with_full_cache(|detector| detector.process_validated(point, timestamp, &missing)))
    }

    /// Process a batch in order and return the records `filter` keeps
    /// (by default, those with a positive grade).
    ///
    /// The whole batch is validated before the first observation is
    /// absorbed. Without `timestamps`, consecutive timestamps continue from
    /// the last one seen.
    pub fn process_sequentially(
        &mut self,
        points: &[Vec<f64>],
        timestamps: Option<&[i64]>,
        filter: Option<&dyn Fn(&AnomalyDescriptor) -> bool>,
    ) -> Result<Vec<AnomalyDescriptor>> {
        let generated: Vec<i64>;
        let timestamps = match timestamps {
            Some(ts) => {
                if ts.len() != points.len() {
                    return Err(DetectorError::TimestampLengthMismatch {
                        timestamps: ts.len(),
                        data: points.len(),
                    });
                }
                for (position, pair) in ts.windows(2).enumerate() {
                    if pair[1] <= pair[0] {
                        return Err(DetectorError::NonAscendingTimestamps {
                            position: position + 1,
                            previous: pair[0],
                            current: pair[1],
                        });
                    }
                }
                ts
            }
            None => {
                let start = self.preprocessor.last_timestamp().map_or(0, |t| t + 1);
                generated = (0..points.len() as i64).map(|i| start + i).collect();
                &generated
            }
        };
        for point in points {
            self.validate_point(point, &[])?;
        }

        let keep = |record: &AnomalyDescriptor| match filter {
            Some(f) => f(record),
            None => record.grade > 0.0,
        };
        let results = self.with_full_cache(|detector| {
            points
                .iter()
                .zip(timestamps)
                .map(|(point, &ts)| detector.process_validated(point, ts, &[]))
                .filter(|record| keep(record))
                .collect::<Vec<_>>()
        });
        debug!("batch of {} points kept {} records", points.len(), results.len());
        Ok(results)
    }

    /// Runs `f` with every tree caching its summary when the configured
    /// cache fraction is zero, restoring the configured fraction afterwards.
    fn with_full_cache<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        if self.backend.cache_fraction() != 0.0 {
            return f(self);
        }
        struct Restore<'a, B: ScoringBackend>(&'a mut ThresholdedRandomCutForest<B>);
        impl<B: ScoringBackend> Drop for Restore<'_, B> {
            fn drop(&mut self) {
                self.0.backend.set_cache_fraction(0.0);
            }
        }
        self.backend.set_cache_fraction(1.0);
        let guard = Restore(self);
        f(&mut *guard.0)
    }

    /// Checks shape, values and missing indices; returns the indices as
    /// positions.
    fn validate_point(&self, point: &[f64], missing: &[i32]) -> Result<Vec<usize>> {
        let length = self.config.dimensions;
        if point.len() != length {
            return Err(DetectorError::DimensionMismatch {
                expected: length,
                actual: point.len(),
            });
        }
        let mut positions = Vec::with_capacity(missing.len());
        for &index in missing {
            if index < 0 {
                return Err(DetectorError::NegativeMissingIndex(index));
            }
            if index as usize >= length {
                return Err(DetectorError::MissingIndexOutOfRange { index, length });
            }
            positions.push(index as usize);
        }
        for (position, &value) in point.iter().enumerate() {
            if !value.is_finite() && !positions.contains(&position) {
                return Err(DetectorError::NonFiniteValue { position, value });
            }
        }
        Ok(positions)
    }

    fn process_validated(&mut self, point: &[f64], timestamp: i64, missing: &[usize]) -> AnomalyDescriptor {
        let imputation = self.impute(point, timestamp, missing);
        let feature = self
            .preprocessor
            .prepare(&imputation.values, timestamp, imputation.imputed);

        let mut record = AnomalyDescriptor {
            input: imputation.values,
            timestamp,
            missing_indices: missing.to_vec(),
            imputed_count: imputation.imputed,
            ..AnomalyDescriptor::default()
        };

        if self.preprocessor.is_shingle_full() {
            let descriptor = self.backend.score(&feature);
            record.expected_values = descriptor
                .expected_point
                .as_deref()
                .map(|expected| self.preprocessor.invert_last(expected));
            self.corrector.process(
                &mut record,
                &descriptor,
                &feature,
                &self.backend,
                self.last_anomaly.as_ref(),
            );
            if self.accepts_update() {
                self.backend.update(&feature);
            } else {
                trace!(
                    "skipping model update at {timestamp}: imputed fraction {:.3}",
                    self.preprocessor.imputed_fraction_in_shingle()
                );
            }
        } else {
            record.threshold = self.corrector.threshold();
        }

        record.grade = record.grade.clamp(0.0, 1.0);
        if record.confidence.is_none() {
            record.confidence = Some(record.grade);
        }
        self.total_updates += 1;
        record.total_updates = self.total_updates;
        record.data_quality = self.preprocessor.data_quality();

        if record.grade > 0.0 {
            debug!(
                "anomaly at {timestamp}: score {:.4} threshold {:.4} grade {:.4}",
                record.score, record.threshold, record.grade
            );
            self.last_anomaly = Some(record.clone());
        }
        record
    }

    fn accepts_update(&self) -> bool {
        self.config.forest_mode != ForestMode::StreamingImpute
            || self.preprocessor.imputed_fraction_in_shingle() <= self.config.use_imputed_fraction
    }

    /// Fill missing values, asking the forest when the policy delegates to it.
    fn impute(&self, point: &[f64], timestamp: i64, missing: &[usize]) -> Imputation {
        if missing.is_empty() {
            return Imputation {
                values: point.to_vec(),
                imputed: 0,
            };
        }
        let delegates = self.config.imputation_method == ImputationMethod::DelegateToModel
            || self.config.forest_mode == ForestMode::StreamingImpute;
        if !delegates {
            return self.preprocessor.impute(point, missing, None);
        }
        match self.model_estimate(point, timestamp, missing) {
            Some(estimate) => Imputation {
                values: point
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| if missing.contains(&i) { estimate[i] } else { v })
                    .collect(),
                imputed: missing.len(),
            },
            None => self.preprocessor.impute(point, missing, None),
        }
    }

    /// The backend's estimate of the observation, in input space, with the
    /// `missing` positions ignored when looking for neighbours.
    fn model_estimate(&self, point: &[f64], timestamp: i64, missing: &[usize]) -> Option<Vec<f64>> {
        if !self.backend.is_output_ready() || !self.preprocessor.is_shingle_full() {
            return None;
        }
        let provisional = self.preprocessor.impute(point, missing, None);
        let mut staged = self.preprocessor.clone();
        let feature = staged.prepare(&provisional.values, timestamp, provisional.imputed);
        let positions = staged.newest_slot_positions(missing);
        let imputed = self.backend.impute(&feature, &positions)?;
        let estimate = staged.invert_last(&imputed);
        estimate.iter().all(|v| v.is_finite()).then_some(estimate)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Observations processed so far.
    pub fn total_updates(&self) -> u64 {
        self.total_updates
    }

    /// Snapshot of the most recent record with a positive grade.
    pub fn last_anomaly(&self) -> Option<&AnomalyDescriptor> {
        self.last_anomaly.as_ref()
    }

    /// The scoring backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn corrector(&self) -> &PredictorCorrector {
        &self.corrector
    }

    /// Change the fraction of trees caching their summaries.
    pub fn set_cache_fraction(&mut self, fraction: f64) {
        self.backend.set_cache_fraction(fraction);
        self.config.bounding_box_cache_fraction = self.backend.cache_fraction();
    }
}
