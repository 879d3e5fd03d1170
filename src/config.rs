//! Detector configuration.
//!
//! `DetectorConfig` is a plain serde-friendly struct; `DetectorConfigBuilder`
//! fills in the defaults and validates the combination before a detector is
//! built from it.

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};

/// How timestamps and missing values take part in scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForestMode {
    Standard,
    /// Inter-arrival gaps become extra scored features.
    TimeAugmented,
    /// Missing values are imputed and heavily imputed shingles are kept out
    /// of the model.
    StreamingImpute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformMethod {
    None,
    Normalize,
    Difference,
    NormalizeDifference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImputationMethod {
    Zero,
    FixedValues,
    Previous,
    Next,
    Linear,
    DelegateToModel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringStrategy {
    ExpectedInverseDepth,
    Distance,
    MultiMode,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Length of each raw observation.
    pub dimensions: usize,
    pub shingle_size: usize,
    /// Reservoir capacity per tree.
    pub sample_size: usize,
    pub number_of_trees: usize,
    /// Discount of the preprocessor statistics; `1 / (10 * sample_size)`
    /// when unset.
    pub time_decay: Option<f64>,
    /// Recency bias of the reservoirs. Zero keeps every point with
    /// probability `sample_size / seen`.
    pub sampler_time_decay: f64,
    /// Discount of the thresholder statistics.
    pub anomaly_rate: f64,
    pub forest_mode: ForestMode,
    pub transform_method: TransformMethod,
    pub imputation_method: ImputationMethod,
    pub scoring_strategy: ScoringStrategy,
    pub start_normalization: u64,
    pub stop_normalization: u64,
    pub clip_factor: f64,
    pub auto_adjust: bool,
    pub absolute_threshold: f64,
    pub z_factor: f64,
    pub random_seed: Option<u64>,
    pub initial_threshold: f64,
    pub minimum_scores: u64,
    /// Weight of the score-difference threshold, in `[0, 1]`.
    pub score_differencing: f64,
    /// Substitutes used by `ImputationMethod::FixedValues`.
    pub fill_values: Option<Vec<f64>>,
    /// Streaming-impute mode skips model updates above this imputed fraction.
    pub use_imputed_fraction: f64,
    pub time_weight: f64,
    pub bounding_box_cache_fraction: f64,
    pub neighbor_count: usize,
    pub noise_factor: f64,
    pub ignore_near_expected_absolute: f64,
    pub ignore_near_expected_ratio: f64,
    pub allowed_noise_run: usize,
    pub score_history: usize,
    pub output_after: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            dimensions: 1,
            shingle_size: 1,
            sample_size: 256,
            number_of_trees: 50,
            time_decay: None,
            sampler_time_decay: 0.0,
            anomaly_rate: 0.01,
            forest_mode: ForestMode::Standard,
            transform_method: TransformMethod::None,
            imputation_method: ImputationMethod::Previous,
            scoring_strategy: ScoringStrategy::ExpectedInverseDepth,
            start_normalization: 10,
            stop_normalization: u64::MAX,
            clip_factor: 10.0,
            auto_adjust: false,
            absolute_threshold: 0.0,
            z_factor: 3.0,
            random_seed: None,
            initial_threshold: 1.0,
            minimum_scores: 10,
            score_differencing: 0.0,
            fill_values: None,
            use_imputed_fraction: 0.5,
            time_weight: 1.0,
            bounding_box_cache_fraction: 1.0,
            neighbor_count: 5,
            noise_factor: 0.5,
            ignore_near_expected_absolute: 0.0,
            ignore_near_expected_ratio: 0.0,
            allowed_noise_run: 2,
            score_history: 128,
            output_after: None,
        }
    }
}

impl DetectorConfig {
    pub fn builder(dimensions: usize) -> DetectorConfigBuilder {
        DetectorConfigBuilder::new(dimensions)
    }

    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DetectorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Length of the vector the forest scores.
    pub fn feature_dimensions(&self) -> usize {
        let base = self.dimensions * self.shingle_size;
        match self.forest_mode {
            ForestMode::TimeAugmented => base + self.shingle_size,
            _ => base,
        }
    }

    pub fn effective_time_decay(&self) -> f64 {
        self.time_decay
            .unwrap_or(1.0 / (10.0 * self.sample_size.max(1) as f64))
    }

    /// Updates the forest needs before it reports non-zero scores: 10% of
    /// the sample size, rounded up, unless set explicitly.
    pub fn effective_output_after(&self) -> u64 {
        self.output_after
            .unwrap_or_else(|| self.sample_size.div_ceil(10) as u64)
            .max(1)
    }

    pub fn effective_z_factor(&self) -> f64 {
        self.z_factor.max(crate::threshold::thresholder::MINIMUM_Z_FACTOR)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(message: String) -> Result<()> {
            Err(DetectorError::InvalidConfig(message))
        }

        if self.dimensions == 0 {
            return invalid("dimensions must be positive".into());
        }
        if self.shingle_size == 0 {
            return invalid("shingle_size must be positive".into());
        }
        if self.sample_size < 2 {
            return invalid(format!("sample_size {} must be at least 2", self.sample_size));
        }
        if self.number_of_trees == 0 {
            return invalid("number_of_trees must be positive".into());
        }
        let time_decay = self.effective_time_decay();
        if !(0.0..1.0).contains(&time_decay) {
            return invalid(format!("time_decay {time_decay} must lie in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.sampler_time_decay) {
            return invalid(format!(
                "sampler_time_decay {} must lie in [0, 1)",
                self.sampler_time_decay
            ));
        }
        if !(self.anomaly_rate > 0.0 && self.anomaly_rate < 1.0) {
            return invalid(format!("anomaly_rate {} must lie in (0, 1)", self.anomaly_rate));
        }
        if self.start_normalization > self.stop_normalization {
            return invalid(format!(
                "start_normalization {} exceeds stop_normalization {}",
                self.start_normalization, self.stop_normalization
            ));
        }
        if !(self.clip_factor > 0.0) {
            return invalid(format!("clip_factor {} must be positive", self.clip_factor));
        }
        if !self.absolute_threshold.is_finite() || self.absolute_threshold < 0.0 {
            return invalid(format!(
                "absolute_threshold {} must be finite and non-negative",
                self.absolute_threshold
            ));
        }
        if !self.z_factor.is_finite() || !self.initial_threshold.is_finite() {
            return invalid("z_factor and initial_threshold must be finite".into());
        }
        if self.minimum_scores == 0 {
            return invalid("minimum_scores must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.score_differencing) {
            return invalid(format!(
                "score_differencing {} must lie in [0, 1]",
                self.score_differencing
            ));
        }
        if !(0.0..=1.0).contains(&self.use_imputed_fraction) {
            return invalid(format!(
                "use_imputed_fraction {} must lie in [0, 1]",
                self.use_imputed_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.bounding_box_cache_fraction) {
            return invalid(format!(
                "bounding_box_cache_fraction {} must lie in [0, 1]",
                self.bounding_box_cache_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.noise_factor) {
            return invalid(format!("noise_factor {} must lie in [0, 1]", self.noise_factor));
        }
        if self.ignore_near_expected_absolute < 0.0 || self.ignore_near_expected_ratio < 0.0 {
            return invalid("ignore-near-expected bands cannot be negative".into());
        }
        if self.neighbor_count == 0 {
            return invalid("neighbor_count must be positive".into());
        }
        match self.imputation_method {
            ImputationMethod::Next => {
                return Err(DetectorError::UnsupportedImputation(ImputationMethod::Next))
            }
            ImputationMethod::FixedValues => match &self.fill_values {
                Some(values) if values.len() == self.dimensions => {}
                Some(values) => {
                    return invalid(format!(
                        "fill_values length {} must equal dimensions {}",
                        values.len(),
                        self.dimensions
                    ))
                }
                None => return invalid("FixedValues imputation requires fill_values".into()),
            },
            _ => {}
        }
        Ok(())
    }
}

/// Builder for `DetectorConfig`. Unset fields keep their defaults, so a
/// built config equals one parsed from the same fields in JSON.
#[derive(Clone, Debug)]
pub struct DetectorConfigBuilder {
    config: DetectorConfig,
}

impl DetectorConfigBuilder {
    pub fn new(dimensions: usize) -> Self {
        DetectorConfigBuilder {
            config: DetectorConfig {
                dimensions,
                ..DetectorConfig::default()
            },
        }
    }

    pub fn shingle_size(mut self, shingle_size: usize) -> Self {
        self.config.shingle_size = shingle_size;
        self
    }

    pub fn sample_size(mut self, sample_size: usize) -> Self {
        self.config.sample_size = sample_size;
        self
    }

    pub fn number_of_trees(mut self, number_of_trees: usize) -> Self {
        self.config.number_of_trees = number_of_trees;
        self
    }

    pub fn time_decay(mut self, time_decay: f64) -> Self {
        self.config.time_decay = Some(time_decay);
        self
    }

    pub fn sampler_time_decay(mut self, time_decay: f64) -> Self {
        self.config.sampler_time_decay = time_decay;
        self
    }

    pub fn anomaly_rate(mut self, anomaly_rate: f64) -> Self {
        self.config.anomaly_rate = anomaly_rate;
        self
    }

    pub fn forest_mode(mut self, mode: ForestMode) -> Self {
        self.config.forest_mode = mode;
        self
    }

    pub fn transform_method(mut self, method: TransformMethod) -> Self {
        self.config.transform_method = method;
        self
    }

    pub fn imputation_method(mut self, method: ImputationMethod) -> Self {
        self.config.imputation_method = method;
        self
    }

    pub fn scoring_strategy(mut self, strategy: ScoringStrategy) -> Self {
        self.config.scoring_strategy = strategy;
        self
    }

    pub fn start_normalization(mut self, start: u64) -> Self {
        self.config.start_normalization = start;
        self
    }

    pub fn stop_normalization(mut self, stop: u64) -> Self {
        self.config.stop_normalization = stop;
        self
    }

    pub fn clip_factor(mut self, clip_factor: f64) -> Self {
        self.config.clip_factor = clip_factor;
        self
    }

    pub fn auto_adjust(mut self, auto_adjust: bool) -> Self {
        self.config.auto_adjust = auto_adjust;
        self
    }

    pub fn absolute_threshold(mut self, threshold: f64) -> Self {
        self.config.absolute_threshold = threshold;
        self
    }

    pub fn z_factor(mut self, z_factor: f64) -> Self {
        self.config.z_factor = z_factor;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.config.random_seed = Some(seed);
        self
    }

    pub fn initial_threshold(mut self, threshold: f64) -> Self {
        self.config.initial_threshold = threshold;
        self
    }

    pub fn minimum_scores(mut self, minimum: u64) -> Self {
        self.config.minimum_scores = minimum;
        self
    }

    pub fn score_differencing(mut self, weight: f64) -> Self {
        self.config.score_differencing = weight;
        self
    }

    pub fn fill_values(mut self, values: Vec<f64>) -> Self {
        self.config.fill_values = Some(values);
        self
    }

    pub fn use_imputed_fraction(mut self, fraction: f64) -> Self {
        self.config.use_imputed_fraction = fraction;
        self
    }

    pub fn time_weight(mut self, weight: f64) -> Self {
        self.config.time_weight = weight;
        self
    }

    pub fn bounding_box_cache_fraction(mut self, fraction: f64) -> Self {
        self.config.bounding_box_cache_fraction = fraction;
        self
    }

    pub fn neighbor_count(mut self, count: usize) -> Self {
        self.config.neighbor_count = count;
        self
    }

    pub fn noise_factor(mut self, factor: f64) -> Self {
        self.config.noise_factor = factor;
        self
    }

    pub fn ignore_near_expected(mut self, absolute: f64, ratio: f64) -> Self {
        self.config.ignore_near_expected_absolute = absolute;
        self.config.ignore_near_expected_ratio = ratio;
        self
    }

    pub fn allowed_noise_run(mut self, run: usize) -> Self {
        self.config.allowed_noise_run = run;
        self
    }

    pub fn score_history(mut self, length: usize) -> Self {
        self.config.score_history = length;
        self
    }

    pub fn output_after(mut self, updates: u64) -> Self {
        self.config.output_after = Some(updates);
        self
    }

    pub fn build(self) -> Result<DetectorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
