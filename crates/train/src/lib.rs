//! # marginalia-train
//!
//! The CRF training layer: a flat parameter model, the per-example
//! conditional log-likelihood objective, and the batch-level
//! (value, gradient) oracle that optimizers drive.
//!
//! The division of labor with external collaborators:
//!
//! - a corpus/feature layer implements [`trainer::FgBuilder`], turning
//!   each example into a factor graph plus gold assignment;
//! - this crate turns (model, graph, gold) into values and gradients over
//!   the flat parameter vector;
//! - an optimizer (SGD, L-BFGS, …) owns the outer loop and parameter
//!   updates.
//!
//! Batch evaluation parallelizes across examples; each example owns its
//! graphs, parameters are read without locking, and gradients merge from
//! per-thread accumulators. Per-example failures are logged and excluded,
//! never fatal to the batch.

pub mod error;
pub mod model;
pub mod objective;
pub mod trainer;

pub use error::TrainError;
pub use model::{FeatureAlphabet, FgModel};
pub use objective::{get_objective, CrfObjective, ObjectiveEval, LL_TOLERANCE};
pub use trainer::{batch_objective, BatchDiagnostics, FgBuilder, TrainConfig};
