use thiserror::Error;

/// Errors raised by the sampling, evaluation and aggregation pipeline.
///
/// Numerical degeneracies (all-zero importance weights, empty statistic
/// bins) are not errors; they are handled by fallback policies at the
/// call site.
#[derive(Debug, Error)]
pub enum NerfError {
    /// Configuration does not match the trained weights or is internally
    /// inconsistent (encoder dimensions, layer shapes, zero counts).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Ray bounds, sample indices or grid extents are unusable.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// A batch does not fit the memory bound even after chunking.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("weight tensor `{name}`: {reason}")]
    Weights { name: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

impl NerfError {
    pub fn config(msg: impl Into<String>) -> Self {
        NerfError::Configuration(msg.into())
    }

    pub fn geometry(msg: impl Into<String>) -> Self {
        NerfError::InvalidGeometry(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, NerfError>;
