use thiserror::Error;

/// The error type for `oneformer-burn` operations.
///
/// Configuration problems are reported when a component is built; shape problems are
/// reported by the call that received the inconsistent tensors. Nothing is coerced
/// silently.
#[derive(Error, Debug)]
pub enum OneFormerError {
    /// Error for when an invalid configuration is provided.
    /// This covers all-zero matching weights, out-of-range sampling ratios and
    /// logically inconsistent layer settings.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when tensors that must agree on a dimension do not.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// The expected shape or dimension.
        expected: String,
        /// The actual shape or dimension.
        actual: String,
    },

    /// Error for reference points that are neither points `(x, y)` nor boxes `(cx, cy, w, h)`.
    #[error("Last dim of reference points must be 2 or 4, but got {last_dim}")]
    InvalidReferencePoints {
        /// The size of the last axis that was received.
        last_dim: usize,
    },

    /// Error for point coordinates outside the normalized `[0, 1]` range.
    #[error("Point coordinates must lie in [0, 1], but got values in [{min}, {max}]")]
    CoordinatesOutOfRange {
        /// Smallest coordinate received.
        min: f64,
        /// Largest coordinate received.
        max: f64,
    },

    /// Error for when the linear assignment solver could not produce a matching.
    #[error("Assignment failed: {reason}")]
    AssignmentFailed {
        /// The reason reported for the failure.
        reason: String,
    },

    /// Error for when a tensor operation fails.
    #[error("Tensor operation failed: {operation}")]
    TensorOperationFailed {
        /// A description of the failed tensor operation.
        operation: String,
    },
}

impl OneFormerError {
    pub(crate) fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for `oneformer-burn` operations.
pub type OneFormerResult<T> = Result<T, OneFormerError>;
