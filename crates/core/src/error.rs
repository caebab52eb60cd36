//! Error types for the core numeric layer.

use thiserror::Error;

use crate::algebra::Algebra;

/// Errors from tensor and algebra construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Raw data length does not match the requested shape.
    #[error("data length {len} does not match shape {dims:?} (expected {expected})")]
    ShapeMismatch {
        len: usize,
        dims: Vec<usize>,
        expected: usize,
    },

    /// Two tensors with different algebras were combined.
    #[error("algebra mismatch: {left:?} vs {right:?}")]
    AlgebraMismatch { left: Algebra, right: Algebra },
}
