//! Streaming anomaly detection with a thresholded random cut forest.
//!
//! Observations go through a [`preprocess::Preprocessor`] (imputation,
//! shingling, transforms), are scored by a [`models::forest::RandomCutForest`]
//! and graded by a [`threshold::corrector::PredictorCorrector`]. The
//! [`ThresholdedRandomCutForest`] orchestrates the three.

pub mod checkpoint;
pub mod config;
pub mod detector;
pub mod error;
pub mod models;
pub mod preprocess;
pub mod threshold;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use config::{
    DetectorConfig, DetectorConfigBuilder, ForestMode, ImputationMethod, ScoringStrategy,
    TransformMethod,
};
pub use detector::{AnomalyDescriptor, ThresholdedRandomCutForest};
pub use error::{DetectorError, Result};
pub use models::base_model::{DiVector, ScoreDescriptor, ScoringBackend};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// A Python module implemented in Rust.
#[cfg(feature = "python")]
#[pymodule]
fn trcf_rust(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::PyThresholdedRandomCutForest>()?;
    m.add_class::<python::PyAnomalyDescriptor>()?;
    Ok(())
}
