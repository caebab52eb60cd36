//! Error types for factor graphs and inference.

use thiserror::Error;

use crate::var::VarId;

/// Errors from graph construction, clamping, and inference.
#[derive(Debug, Clone, Error)]
pub enum InferError {
    /// A factor or config referenced a variable the graph does not own.
    #[error("unknown variable {var:?} (graph has {count} variables)")]
    UnknownVar { var: VarId, count: usize },

    /// A state index is out of range for its variable.
    #[error("state {state} out of range for variable {var:?} with {arity} states")]
    StateOutOfRange {
        var: VarId,
        state: usize,
        arity: usize,
    },

    /// A factor's captured arity disagrees with the graph's variable.
    #[error("factor arity mismatch on {var:?}: factor captured {captured}, graph has {actual}")]
    ArityMismatch {
        var: VarId,
        captured: usize,
        actual: usize,
    },

    /// Clamping fixed some but not all variables of a global factor. No
    /// well-defined message algorithm exists for a partially conditioned
    /// combinatorial factor; clamp all of its variables or none.
    #[error("global factor {factor} is only partially covered by the clamping assignment")]
    PartiallyClampedGlobalFactor { factor: usize },

    /// An exponential-family factor needs model parameters to produce
    /// potentials, but none were supplied.
    #[error("factor {factor} has feature-based potentials but no parameters were supplied")]
    MissingParams { factor: usize },

    /// The tree schedule was requested on a cyclic factor graph.
    #[error("tree schedule requires an acyclic factor graph; use the flood schedule")]
    CyclicTreeSchedule,

    /// A structured factor received a hard-TRUE incoming message. Hard
    /// evidence on a structured factor's variables must go through
    /// clamping, which conditions the factor exactly.
    #[error("structured factor received a zero FALSE-state message on edge {edge}; clamp the variable instead")]
    StructuredHardEvidence { edge: usize },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}
