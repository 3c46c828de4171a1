//! Error types for rlpack.

use thiserror::Error;

/// Result type alias for rlpack operations.
pub type Result<T> = std::result::Result<T, RlPackError>;

/// Main error type for rlpack operations.
#[derive(Error, Debug)]
pub enum RlPackError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Per-token channels of a single result disagree in length.
    #[error(
        "Channel length mismatch: token_ids={token_ids}, input_pos={input_pos}, assistant_mask={assistant_mask}"
    )]
    ChannelLengthMismatch {
        /// Length of `token_ids`.
        token_ids: usize,
        /// Length of `input_pos`.
        input_pos: usize,
        /// Length of `assistant_mask`.
        assistant_mask: usize,
    },

    /// No supervised tokens in the whole batch, so weights cannot be normalized.
    #[error("Empty batch: no assistant tokens to normalize weights over")]
    EmptyBatch,

    /// A persisted buffer does not match its declared shape.
    #[error("Size mismatch for {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// File that failed validation.
        path: String,
        /// Expected size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    /// Tensor shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Buffer contents cannot be interpreted as the channel's element type.
    #[error("Format error: {0}")]
    Format(String),

    /// Row index past the end of a dataset.
    #[error("Index {index} out of bounds for dataset of length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of rows.
        len: usize,
    },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RlPackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RlPackError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
