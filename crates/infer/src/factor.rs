//! # Factors
//!
//! A [`Factor`] scores joint configurations of its [`VarSet`]. The closed
//! variant set keeps dispatch explicit:
//!
//! - [`Factor::Explicit`] — a dense table of log potentials.
//! - [`Factor::ExpFamily`] — exponential-family: each configuration carries
//!   a sparse feature vector and scores `θ·f` under the current model.
//! - [`Factor::Global`] — no table at all; exact messages and scores come
//!   from a combinatorial algorithm behind the [`GlobalFactor`] trait.
//!
//! Every variant implements the same gradient capability
//! ([`Factor::accumulate_gradient`]): exponential-family factors
//! contribute expected feature counts, the others contribute nothing.

use std::sync::Arc;

use smallvec::SmallVec;

use marginalia_core::{Algebra, Tensor};

use crate::error::InferError;
use crate::varset::{VarConfig, VarSet};

/// A sparse feature vector: `(feature index, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVec(SmallVec<[(usize, f64); 8]>);

impl FeatureVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, feature: usize, value: f64) {
        self.0.push((feature, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `θ·f` for a flat parameter vector.
    pub fn dot(&self, params: &[f64]) -> f64 {
        self.0.iter().map(|&(i, v)| params[i] * v).sum()
    }
}

impl FromIterator<(usize, f64)> for FeatureVec {
    fn from_iter<T: IntoIterator<Item = (usize, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A dense table of log potentials over a variable set.
#[derive(Debug, Clone)]
pub struct ExplicitFactor {
    vars: VarSet,
    log_potentials: Tensor,
}

impl ExplicitFactor {
    /// Build from per-configuration natural-log potentials, ordered by the
    /// set's mixed-radix encoding.
    pub fn new(vars: VarSet, log_potentials: Vec<f64>) -> Self {
        assert_eq!(
            log_potentials.len(),
            vars.num_configs(),
            "potential table must cover every configuration"
        );
        Self {
            vars,
            log_potentials: Tensor::vector(Algebra::Log, log_potentials),
        }
    }

    /// Build from real-space potentials.
    pub fn from_reals(vars: VarSet, potentials: &[f64]) -> Self {
        Self::new(vars, potentials.iter().map(|&p| p.ln()).collect())
    }

    /// A nullary constant factor.
    pub fn constant(log_value: f64) -> Self {
        Self::new(VarSet::empty(), vec![log_value])
    }

    pub fn vars(&self) -> &VarSet {
        &self.vars
    }

    pub fn log_potentials(&self) -> &Tensor {
        &self.log_potentials
    }
}

/// An exponential-family factor: sparse features per configuration.
#[derive(Debug, Clone)]
pub struct ExpFamilyFactor {
    vars: VarSet,
    features: Vec<FeatureVec>,
}

impl ExpFamilyFactor {
    pub fn new(vars: VarSet, features: Vec<FeatureVec>) -> Self {
        assert_eq!(
            features.len(),
            vars.num_configs(),
            "feature table must cover every configuration"
        );
        Self { vars, features }
    }

    pub fn vars(&self) -> &VarSet {
        &self.vars
    }

    pub fn features(&self) -> &[FeatureVec] {
        &self.features
    }

    /// Materialize log potentials `θ·f` under a parameter vector.
    pub fn log_potentials(&self, params: &[f64]) -> Tensor {
        Tensor::vector(
            Algebra::Log,
            self.features.iter().map(|f| f.dot(params)).collect(),
        )
    }
}

/// Numerical-health counters a structured factor reports back instead of
/// mutating process-wide state.
#[derive(Debug, Clone, Copy)]
pub struct StructuredDiagnostics {
    /// Largest log odds ratio seen across incident edges.
    pub max_log_odds: f64,
    /// Smallest log odds ratio seen across incident edges.
    pub min_log_odds: f64,
    /// Beliefs clamped to the additive identity by log-subtract underflow.
    pub clamped_beliefs: usize,
}

impl Default for StructuredDiagnostics {
    fn default() -> Self {
        Self {
            max_log_odds: f64::NEG_INFINITY,
            min_log_odds: f64::INFINITY,
            clamped_beliefs: 0,
        }
    }
}

impl StructuredDiagnostics {
    pub fn observe_log_odds(&mut self, lo: f64) {
        if lo > self.max_log_odds {
            self.max_log_odds = lo;
        }
        if lo < self.min_log_odds {
            self.min_log_odds = lo;
        }
    }

    pub fn merge(&mut self, other: &StructuredDiagnostics) {
        // The sentinels of an untouched diagnostics never win a comparison.
        if other.max_log_odds > self.max_log_odds {
            self.max_log_odds = other.max_log_odds;
        }
        if other.min_log_odds < self.min_log_odds {
            self.min_log_odds = other.min_log_odds;
        }
        self.clamped_beliefs += other.clamped_beliefs;
    }
}

/// All outgoing messages of a global factor, computed in one call.
#[derive(Debug)]
pub struct GlobalOutput {
    /// One message per incident variable, in the factor's `VarSet` order.
    pub messages: Vec<Tensor>,
    /// Natural log of the partition function read at this factor
    /// (incoming messages times potentials, summed over all assignments).
    pub log_partition: f64,
    pub diagnostics: StructuredDiagnostics,
}

/// A factor whose domain is too large to tabulate; marginals and messages
/// come from an embedded combinatorial algorithm.
pub trait GlobalFactor: std::fmt::Debug + Send + Sync {
    fn vars(&self) -> &VarSet;

    /// Compute every outgoing message from the incoming variable-to-factor
    /// messages (one per variable, in `VarSet` order, in a shared algebra).
    fn compute_messages(&self, incoming: &[Tensor]) -> Result<GlobalOutput, InferError>;

    /// Natural-log score of a total assignment over this factor's
    /// variables: `0.0` (the multiplicative identity) iff the assignment
    /// is exactly one valid structure, `-inf` otherwise.
    fn log_unnormalized_score(&self, config: &VarConfig) -> f64;
}

/// A factor of the graph: tabular, exponential-family, or global.
#[derive(Debug, Clone)]
pub enum Factor {
    Explicit(ExplicitFactor),
    ExpFamily(ExpFamilyFactor),
    Global(Arc<dyn GlobalFactor>),
}

impl Factor {
    pub fn vars(&self) -> &VarSet {
        match self {
            Factor::Explicit(f) => f.vars(),
            Factor::ExpFamily(f) => f.vars(),
            Factor::Global(f) => f.vars(),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Factor::Global(_))
    }

    /// Dense log-potential table, materialized under `params` where
    /// needed. `Ok(None)` for global factors, which have no table.
    pub fn log_potentials(
        &self,
        index: usize,
        params: Option<&[f64]>,
    ) -> Result<Option<Tensor>, InferError> {
        match self {
            Factor::Explicit(f) => Ok(Some(f.log_potentials().clone())),
            Factor::ExpFamily(f) => match params {
                Some(p) => Ok(Some(f.log_potentials(p))),
                None => Err(InferError::MissingParams { factor: index }),
            },
            Factor::Global(_) => Ok(None),
        }
    }

    /// Natural-log score of a total assignment over this factor's vars.
    pub fn log_unnormalized_score(
        &self,
        index: usize,
        config: &VarConfig,
        params: Option<&[f64]>,
    ) -> Result<f64, InferError> {
        match self {
            Factor::Explicit(f) => {
                Ok(f.log_potentials().get_flat(f.vars().config_index(config)))
            }
            Factor::ExpFamily(f) => match params {
                Some(p) => Ok(f.features()[f.vars().config_index(config)].dot(p)),
                None => Err(InferError::MissingParams { factor: index }),
            },
            Factor::Global(f) => Ok(f.log_unnormalized_score(config)),
        }
    }

    /// Uniform gradient capability: add `multiplier × E_b[f]` into `grad`
    /// for each feature of an exponential-family factor. `beliefs` are
    /// per-configuration probabilities in real space. Tabular and global
    /// factors carry no feature parameters and contribute nothing.
    pub fn accumulate_gradient(&self, beliefs: Option<&[f64]>, multiplier: f64, grad: &mut [f64]) {
        if let Factor::ExpFamily(f) = self {
            let beliefs = beliefs.expect("exponential-family factor needs beliefs for gradient");
            debug_assert_eq!(beliefs.len(), f.features().len());
            for (config, fv) in f.features().iter().enumerate() {
                let p = beliefs[config];
                if p == 0.0 {
                    continue;
                }
                for (feature, value) in fv.iter() {
                    grad[feature] += multiplier * p * value;
                }
            }
        }
    }
}
