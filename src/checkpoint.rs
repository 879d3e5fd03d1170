//! Checkpoint container: a fixed header followed by a bincode payload.
//!
//! ```text
//! offset  size  field
//!      0     4  magic  b"TRCF"
//!      4     2  format version (little endian)
//!      6     1  flags  (bit 0: reservoir points stored as f32)
//!      7     8  payload length (little endian)
//!     15    32  blake3 hash of the payload
//!     47     n  payload
//! ```
//!
//! Decoding checks magic, version, length and hash, in that order, before
//! the payload is deserialized.

use log::debug;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::config::DetectorConfig;
use crate::detector::AnomalyDescriptor;
use crate::error::{DetectorError, Result};
use crate::models::base_model::ScoringBackend;
use crate::models::forest::RandomCutForest;
use crate::models::sampler::ReservoirSampler;
use crate::models::tree::RandomCutTree;
use crate::preprocess::Preprocessor;
use crate::threshold::corrector::PredictorCorrector;
use crate::utils::random::Lcg48;

pub const MAGIC: [u8; 4] = *b"TRCF";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 8 + 32;

const FLAG_COMPRESSED: u8 = 0b1;

/// Occupied reservoir rows, at full or single precision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PointMatrix {
    Exact(Array2<f64>),
    Compact(Array2<f32>),
}

impl PointMatrix {
    fn capture(points: &Array2<f64>, size: usize, compress: bool) -> Self {
        let occupied = points.slice(s![..size, ..]);
        if compress {
            PointMatrix::Compact(occupied.mapv(|v| v as f32))
        } else {
            PointMatrix::Exact(occupied.to_owned())
        }
    }

    fn rows(&self) -> usize {
        match self {
            PointMatrix::Exact(m) => m.nrows(),
            PointMatrix::Compact(m) => m.nrows(),
        }
    }

    fn columns(&self) -> usize {
        match self {
            PointMatrix::Exact(m) => m.ncols(),
            PointMatrix::Compact(m) => m.ncols(),
        }
    }

    /// Widen into a `capacity`-row matrix, zero below the stored rows.
    fn expand(&self, capacity: usize, dimensions: usize) -> Array2<f64> {
        let mut points = Array2::zeros((capacity, dimensions));
        let rows = self.rows().min(capacity);
        match self {
            PointMatrix::Exact(m) => points
                .slice_mut(s![..rows, ..])
                .assign(&m.slice(s![..rows, ..])),
            PointMatrix::Compact(m) => points
                .slice_mut(s![..rows, ..])
                .assign(&m.slice(s![..rows, ..]).mapv(f64::from)),
        }
        points
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeState {
    pub seed: u64,
    pub rng: Lcg48,
    pub caching: bool,
    pub capacity: usize,
    pub time_decay: f64,
    pub seen: u64,
    pub weights: Vec<f64>,
    pub points: PointMatrix,
}

impl TreeState {
    fn capture(tree: &RandomCutTree, compress: bool) -> Self {
        let sampler = tree.sampler();
        TreeState {
            seed: tree.seed(),
            rng: tree.rng().clone(),
            caching: tree.is_caching(),
            capacity: sampler.capacity(),
            time_decay: sampler.time_decay(),
            seen: sampler.seen(),
            weights: sampler.weights().to_vec(),
            points: PointMatrix::capture(sampler.points(), sampler.size(), compress),
        }
    }

    fn check_shape(&self, index: usize, capacity: usize, dimensions: usize) -> Result<()> {
        let problem = if self.capacity != capacity {
            format!("capacity {} differs from sample size {capacity}", self.capacity)
        } else if self.points.columns() != dimensions {
            format!("points have {} columns, expected {dimensions}", self.points.columns())
        } else if self.points.rows() > capacity {
            format!("{} points exceed capacity {capacity}", self.points.rows())
        } else if self.weights.len() != self.points.rows() {
            format!("{} weights for {} points", self.weights.len(), self.points.rows())
        } else {
            return Ok(());
        };
        Err(DetectorError::InconsistentState(format!("tree {index}: {problem}")))
    }

    fn restore(&self, dimensions: usize) -> RandomCutTree {
        let size = self.points.rows().min(self.capacity);
        let sampler = ReservoirSampler::from_parts(
            self.points.expand(self.capacity, dimensions),
            self.weights.iter().copied().take(size).collect(),
            size,
            self.seen,
            self.time_decay,
        );
        RandomCutTree::from_parts(self.seed, self.rng.clone(), sampler, self.caching)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForestState {
    pub dimensions: usize,
    pub shingle_size: usize,
    pub sample_size: usize,
    pub seed: u64,
    pub total_updates: u64,
    pub output_after: u64,
    pub neighbor_count: usize,
    pub cache_fraction: f64,
    pub trees: Vec<TreeState>,
}

impl ForestState {
    pub fn capture(forest: &RandomCutForest, compress: bool) -> Self {
        ForestState {
            dimensions: forest.dimensions(),
            shingle_size: forest.shingle_size(),
            sample_size: forest.sample_size(),
            seed: forest.seed(),
            total_updates: forest.total_updates(),
            output_after: forest.output_after(),
            neighbor_count: forest.neighbor_count(),
            cache_fraction: forest.cache_fraction(),
            trees: forest
                .trees()
                .iter()
                .map(|t| TreeState::capture(t, compress))
                .collect(),
        }
    }

    /// Check the captured forest against the configuration it is restored
    /// under, before any of it is rebuilt.
    pub fn check_shape(&self, config: &DetectorConfig) -> Result<()> {
        let expected = [
            ("dimensions", config.feature_dimensions(), self.dimensions),
            ("shingle size", config.shingle_size, self.shingle_size),
            ("sample size", config.sample_size, self.sample_size),
            ("tree count", config.number_of_trees, self.trees.len()),
        ];
        for (what, wanted, found) in expected {
            if wanted != found {
                return Err(DetectorError::InconsistentState(format!(
                    "forest {what} is {found}, expected {wanted}"
                )));
            }
        }
        for (index, tree) in self.trees.iter().enumerate() {
            tree.check_shape(index, self.sample_size, self.dimensions)?;
        }
        Ok(())
    }

    pub fn restore(&self) -> RandomCutForest {
        let trees = self
            .trees
            .iter()
            .map(|t| t.restore(self.dimensions))
            .collect();
        RandomCutForest::from_parts(
            trees,
            self.dimensions,
            self.shingle_size,
            self.sample_size,
            self.seed,
            self.total_updates,
            self.output_after,
            self.neighbor_count,
            self.cache_fraction,
        )
    }
}

/// Everything needed to resume a detector exactly where it stopped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorState {
    pub config: DetectorConfig,
    pub forest: ForestState,
    pub preprocessor: Preprocessor,
    pub corrector: PredictorCorrector,
    pub last_anomaly: Option<AnomalyDescriptor>,
    pub total_updates: u64,
}

impl DetectorState {
    /// Validate the configuration and every captured shape against it.
    pub fn check(&self) -> Result<()> {
        self.config.validate()?;
        self.forest.check_shape(&self.config)?;
        self.preprocessor.check_shape(&self.config)
    }
}

pub fn encode(state: &DetectorState, compress: bool) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.push(if compress { FLAG_COMPRESSED } else { 0 });
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(blake3::hash(&payload).as_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<DetectorState> {
    if bytes.len() < HEADER_LEN {
        return Err(DetectorError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[0..4]);
    if magic != MAGIC {
        return Err(DetectorError::BadMagic { found: magic });
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(DetectorError::UnsupportedVersion(version));
    }

    let mut length = [0u8; 8];
    length.copy_from_slice(&header[7..15]);
    let length = u64::from_le_bytes(length);
    if length != payload.len() as u64 {
        return Err(DetectorError::Truncated {
            expected: HEADER_LEN.saturating_add(length as usize),
            actual: bytes.len(),
        });
    }

    if blake3::hash(payload).as_bytes() != &header[15..HEADER_LEN] {
        return Err(DetectorError::ChecksumMismatch);
    }

    let state: DetectorState = bincode::deserialize(payload)?;
    debug!(
        "decoded checkpoint: {} payload bytes, {} trees, compressed {}",
        payload.len(),
        state.forest.trees.len(),
        header[6] & FLAG_COMPRESSED != 0
    );
    Ok(state)
}
