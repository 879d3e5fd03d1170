use numpy::{PyArray1, PyArray2};
use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::config::DetectorConfig;
use crate::detector::{AnomalyDescriptor, ThresholdedRandomCutForest as Detector};
use crate::error::DetectorError;

fn to_py_err(err: DetectorError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Accept a float64 numpy array or any float sequence.
fn extract_point(x: &PyAny) -> PyResult<Vec<f64>> {
    if let Ok(arr) = x.extract::<&PyArray1<f64>>() {
        return Ok(arr.readonly().as_array().to_vec());
    }
    x.extract::<Vec<f64>>()
        .map_err(|_| PyTypeError::new_err("Expected a 1D numpy array or sequence of floats"))
}

fn extract_points(xs: &PyAny) -> PyResult<Vec<Vec<f64>>> {
    if let Ok(arr) = xs.extract::<&PyArray2<f64>>() {
        return Ok(arr
            .readonly()
            .as_array()
            .rows()
            .into_iter()
            .map(|row| row.to_vec())
            .collect());
    }
    xs.extract::<Vec<Vec<f64>>>()
        .map_err(|_| PyTypeError::new_err("Expected a 2D numpy array of float64 values"))
}

/// Read-only view of one scored observation.
#[pyclass(name = "AnomalyDescriptor")]
#[derive(Clone)]
pub struct PyAnomalyDescriptor {
    inner: AnomalyDescriptor,
}

#[pymethods]
impl PyAnomalyDescriptor {
    #[getter]
    fn timestamp(&self) -> i64 {
        self.inner.timestamp
    }

    #[getter]
    fn score(&self) -> f64 {
        self.inner.score
    }

    #[getter]
    fn threshold(&self) -> f64 {
        self.inner.threshold
    }

    #[getter]
    fn grade(&self) -> f64 {
        self.inner.grade
    }

    #[getter]
    fn confidence(&self) -> Option<f64> {
        self.inner.confidence
    }

    #[getter]
    fn input(&self) -> Vec<f64> {
        self.inner.input.clone()
    }

    #[getter]
    fn expected_values(&self) -> Option<Vec<f64>> {
        self.inner.expected_values.clone()
    }

    #[getter]
    fn missing_indices(&self) -> Vec<usize> {
        self.inner.missing_indices.clone()
    }

    #[getter]
    fn total_updates(&self) -> u64 {
        self.inner.total_updates
    }

    fn __repr__(&self) -> String {
        format!(
            "AnomalyDescriptor(timestamp={}, score={:.4}, threshold={:.4}, grade={:.4})",
            self.inner.timestamp, self.inner.score, self.inner.threshold, self.inner.grade
        )
    }
}

/// Python wrapper around the streaming detector.
#[pyclass(name = "ThresholdedRandomCutForest")]
pub struct PyThresholdedRandomCutForest {
    inner: Detector,
}

#[pymethods]
impl PyThresholdedRandomCutForest {
    /// ThresholdedRandomCutForest(dimensions, shingle_size=1, sample_size=256, number_of_trees=50, random_seed=None, config_json=None)
    ///
    /// `config_json`, when given, takes precedence over the other arguments.
    #[new]
    #[pyo3(signature = (dimensions, shingle_size=1, sample_size=256, number_of_trees=50, random_seed=None, config_json=None))]
    fn new(
        dimensions: usize,
        shingle_size: usize,
        sample_size: usize,
        number_of_trees: usize,
        random_seed: Option<u64>,
        config_json: Option<&str>,
    ) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => DetectorConfig::from_json(json),
            None => {
                let mut builder = DetectorConfig::builder(dimensions)
                    .shingle_size(shingle_size)
                    .sample_size(sample_size)
                    .number_of_trees(number_of_trees);
                if let Some(seed) = random_seed {
                    builder = builder.random_seed(seed);
                }
                builder.build()
            }
        }
        .map_err(to_py_err)?;
        let inner = Detector::new(config).map_err(to_py_err)?;
        Ok(PyThresholdedRandomCutForest { inner })
    }

    #[pyo3(signature = (point, timestamp, missing=None))]
    fn process(&mut self, point: &PyAny, timestamp: i64, missing: Option<Vec<i32>>) -> PyResult<PyAnomalyDescriptor> {
        let point = extract_point(point)?;
        let missing = missing.unwrap_or_default();
        let inner = self.inner.process(&point, timestamp, &missing).map_err(to_py_err)?;
        Ok(PyAnomalyDescriptor { inner })
    }

    /// Returns only the records with a positive grade.
    #[pyo3(signature = (points, timestamps=None))]
    fn process_sequentially(
        &mut self,
        points: &PyAny,
        timestamps: Option<Vec<i64>>,
    ) -> PyResult<Vec<PyAnomalyDescriptor>> {
        let points = extract_points(points)?;
        let records = self
            .inner
            .process_sequentially(&points, timestamps.as_deref(), None)
            .map_err(to_py_err)?;
        Ok(records
            .into_iter()
            .map(|inner| PyAnomalyDescriptor { inner })
            .collect())
    }

    #[pyo3(signature = (compress=false))]
    fn checkpoint<'py>(&self, py: Python<'py>, compress: bool) -> PyResult<&'py PyBytes> {
        let bytes = self.inner.to_checkpoint(compress).map_err(to_py_err)?;
        Ok(PyBytes::new(py, &bytes))
    }

    #[staticmethod]
    fn restore(bytes: &[u8]) -> PyResult<Self> {
        let inner = Detector::from_checkpoint(bytes).map_err(to_py_err)?;
        Ok(PyThresholdedRandomCutForest { inner })
    }

    #[getter]
    fn total_updates(&self) -> u64 {
        self.inner.total_updates()
    }

    fn config_json(&self) -> PyResult<String> {
        self.inner.config().to_json().map_err(to_py_err)
    }
}
