//! Error types for resampling, blending and chunked execution.

use thiserror::Error;

use crate::volume::Shape;

/// Result type for resampling operations.
pub type Result<T> = std::result::Result<T, ResampleError>;

/// Errors raised by the resampling core.
///
/// None of these are transient: every variant describes a logical or
/// physical mismatch, so nothing in this crate retries on them.
#[derive(Debug, Error)]
pub enum ResampleError {
    /// The linear block of an affine matrix is not invertible, or its Gram
    /// matrix is not positive-definite.
    #[error("singular transform: {0}")]
    SingularTransform(String),

    /// Unknown interpolation method or element type, or a combination that
    /// has no kernel.
    #[error("unsupported kernel: {0}")]
    UnsupportedKernel(String),

    /// Wrong residency, wrong device, empty volume or bad launch geometry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operands that must share a shape do not.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape required by the operation
        expected: Shape,
        /// Shape that was supplied
        actual: Shape,
    },

    /// A processing chunk does not fit into the target shape.
    #[error("invalid chunk size on axis {axis}: chunk {chunk} exceeds dimension {dim}")]
    InvalidChunkSize {
        /// Axis index in (Z, Y, X) order
        axis: usize,
        /// Requested chunk extent
        chunk: usize,
        /// Target extent along the axis
        dim: usize,
    },

    /// Adapter, device or kernel failure reported by the compute backend.
    #[error("device error: {0}")]
    Device(String),

    /// Persisted array IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted array metadata could not be read or written.
    #[error("array metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// A distributed run finished with failed chunks.
    #[error("output incomplete: {failed} of {total} chunks failed")]
    IncompleteOutput {
        /// Number of chunks that failed
        failed: usize,
        /// Number of chunks planned
        total: usize,
    },
}

impl ResampleError {
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedKernel(msg.into())
    }

    pub(crate) fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Self {
        Self::Device("lock poisoned by a panicking worker".to_string())
    }
}
