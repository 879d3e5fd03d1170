use crate::config::ImputationMethod;

/// Errors raised by the detector.
///
/// Input-contract violations are detected before any state is touched, so a
/// failed call leaves the model exactly as it was. Checkpoint errors are
/// recoverable; the caller decides whether to fall back to a cold start.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("missing index {0} cannot be negative")]
    NegativeMissingIndex(i32),

    #[error("missing index {index} must be less than point length {length}")]
    MissingIndexOutOfRange { index: i32, length: usize },

    #[error("point length {actual} does not match configured dimensions {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("non-finite value {value} at position {position}")]
    NonFiniteValue { position: usize, value: f64 },

    #[error("timestamps length {timestamps} must equal data length {data}")]
    TimestampLengthMismatch { timestamps: usize, data: usize },

    #[error("timestamps must be strictly ascending: {current} at position {position} does not follow {previous}")]
    NonAscendingTimestamps {
        position: usize,
        previous: i64,
        current: i64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("imputation method {0:?} is not supported on a stream")]
    UnsupportedImputation(ImputationMethod),

    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("checkpoint magic mismatch: found {found:?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u16),

    #[error("checkpoint truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("checkpoint checksum mismatch")]
    ChecksumMismatch,

    #[error("checkpoint state is inconsistent: {0}")]
    InconsistentState(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, DetectorError>;

impl DetectorError {
    /// True for errors that reject caller input (as opposed to checkpoint integrity).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DetectorError::NegativeMissingIndex(_)
                | DetectorError::MissingIndexOutOfRange { .. }
                | DetectorError::DimensionMismatch { .. }
                | DetectorError::NonFiniteValue { .. }
                | DetectorError::TimestampLengthMismatch { .. }
                | DetectorError::NonAscendingTimestamps { .. }
        )
    }
}
