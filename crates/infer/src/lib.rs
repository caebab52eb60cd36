//! # marginalia-infer
//!
//! Factor graphs over discrete variables, sum-product belief propagation,
//! and global factors whose exact marginals come from embedded
//! inside-outside dynamic programs.
//!
//! The layers, bottom up:
//!
//! - [`var`] / [`varset`] — variables, ordered variable sets with a
//!   mixed-radix configuration encoding, partial assignments;
//! - [`factor`] — the closed factor variants (explicit table,
//!   exponential family, global) and the [`factor::GlobalFactor`] trait;
//! - [`graph`] — the arena bipartite [`graph::FactorGraph`] and clamping;
//! - [`bp`] — the message-passing engine, schedules, beliefs, and
//!   per-node partition readings;
//! - [`global`] — the projective-dependency-tree and
//!   constituency-bracketing factors with their differentiable dynamic
//!   programs;
//! - [`exact`] — enumeration over small graphs, the test oracle.
//!
//! ```rust
//! use marginalia_infer::bp::{run_inference, BpConfig};
//! use marginalia_infer::factor::{ExplicitFactor, Factor};
//! use marginalia_infer::graph::FactorGraph;
//! use marginalia_infer::var::{Var, VarKind};
//!
//! let mut fg = FactorGraph::new();
//! let x = fg.add_var(Var::binary("x", VarKind::Predicted));
//! let vs = fg.var_set(&[x]).unwrap();
//! fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(vs, &[1.0, 3.0]))).unwrap();
//!
//! let beliefs = run_inference(&fg, &BpConfig::default()).unwrap();
//! assert!((beliefs.var_marginal(x)[1] - 0.75).abs() < 1e-9);
//! ```

pub mod bp;
pub mod error;
pub mod exact;
pub mod factor;
pub mod global;
pub mod graph;
pub mod var;
pub mod varset;

pub use bp::{
    run_inference, run_inference_with_params, BeliefPropagation, Beliefs, BpConfig,
    BpDiagnostics, BpSchedule, UpdateOrder,
};
pub use error::InferError;
pub use factor::{
    ExpFamilyFactor, ExplicitFactor, Factor, FeatureVec, GlobalFactor, GlobalOutput,
    StructuredDiagnostics,
};
pub use global::{ConsTreeFactor, DepLinks, ProjDepTreeFactor, SpanVars};
pub use graph::{Edge, EdgeId, FactorGraph, FactorId};
pub use var::{Var, VarId, VarKind, VarLabel, FALSE, TRUE};
pub use varset::{VarConfig, VarSet};
