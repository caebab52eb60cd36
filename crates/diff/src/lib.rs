//! # marginalia-diff
//!
//! Reverse-mode automatic differentiation over semiring tensors.
//!
//! A computation is a [`graph::ModuleGraph`]: a DAG whose nodes apply
//! [`ops::Op`] operations, cache their outputs, and accumulate adjoints.
//! Forward evaluation runs in topological order; the backward pass runs in
//! exact reverse order and *adds into* each input's adjoint, so a value
//! consumed by several modules receives every contribution.
//!
//! Gradients of log-space computations can be negative, so adjoints live in
//! the forward algebra's [`marginalia_core::Algebra::grad_algebra`]
//! (signed-log for log-space forwards).
//!
//! Structured dynamic programs plug in through [`ops::ExternOp`] and are
//! differentiated uniformly with everything else; [`gradcheck::grad_check`]
//! verifies any scalar-output graph against central differences.
//!
//! ```rust
//! use marginalia_core::{Algebra, Tensor};
//! use marginalia_diff::graph::ModuleGraph;
//!
//! let mut g = ModuleGraph::new();
//! let x = g.input();
//! let out = g.sum(x);
//! g.mark_output(out);
//! g.forward(&[Tensor::from_reals(Algebra::Log, &[0.25, 0.75])]);
//! assert!((Algebra::Log.to_real(g.output_value().as_scalar()) - 1.0).abs() < 1e-12);
//! ```

pub mod gradcheck;
pub mod graph;
pub mod ops;

pub use gradcheck::{grad_check, GradCheckError};
pub use graph::{ModuleGraph, ModuleNode};
pub use ops::{ExternOp, Op};
