//! # marginalia-core
//!
//! Numerically stable semiring arithmetic and dense semiring tensors — the
//! value layer everything else in the workspace is written against.
//!
//! Inference over structured distributions multiplies many probabilities
//! that span hundreds of orders of magnitude, and gradients of log-space
//! quantities need a representable sign. Three arithmetics cover the space:
//!
//! - [`Algebra::Real`] for small, well-conditioned problems and tests,
//! - [`Algebra::Log`] for production inference (no underflow),
//! - [`Algebra::SignedLog`] for adjoints of log-space computations
//!   (subtraction without leaving log space).
//!
//! ```rust
//! use marginalia_core::{Algebra, Tensor};
//!
//! let msg = Tensor::from_reals(Algebra::Log, &[0.5, 0.5]);
//! assert!((Algebra::Log.to_real(msg.sum()) - 1.0).abs() < 1e-12);
//! ```

pub mod algebra;
pub mod error;
pub mod tensor;

pub use algebra::{log_add, log_subtract, safe_log_subtract, Algebra};
pub use error::CoreError;
pub use tensor::Tensor;
