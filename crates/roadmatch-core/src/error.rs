use thiserror::Error;

/// Errors that can occur in the CRF core.
#[derive(Debug, Error)]
pub enum RoadMatchError {
    /// Emission, tag, mask, embedding or adjacency dimensions disagree.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// The input whose shape is wrong.
        what: &'static str,
        /// The shape the caller should have provided.
        expected: String,
        /// The shape that was actually provided.
        actual: String,
    },

    /// A tag index falls outside `[0, num_tags)`.
    #[error("tag index {index} out of range for {num_tags} tags")]
    InvalidTagIndex {
        /// The offending index.
        index: i64,
        /// Size of the tag space.
        num_tags: usize,
    },

    /// The negative sample cannot be drawn without replacement.
    #[error("sample size {sample_size} must be smaller than the number of tags ({num_tags})")]
    SampleSizeTooLarge {
        /// Requested number of sampled tags.
        sample_size: usize,
        /// Size of the tag space.
        num_tags: usize,
    },

    /// The validity mask is not a prefix of ones starting at the first step.
    #[error("invalid mask: {0}")]
    InvalidMask(String),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor backend error.
    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl RoadMatchError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

/// Result type alias for roadmatch operations.
pub type Result<T> = std::result::Result<T, RoadMatchError>;
