//! Error types for the training layer.

use thiserror::Error;

use marginalia_infer::InferError;

/// Errors from objective construction and evaluation.
#[derive(Debug, Clone, Error)]
pub enum TrainError {
    /// Inference failed on one of the objective's graphs.
    #[error(transparent)]
    Infer(#[from] InferError),

    /// Example construction rejected its input.
    #[error("bad training example: {0}")]
    BadExample(String),
}
