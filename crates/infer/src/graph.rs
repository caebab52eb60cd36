//! # Factor graphs
//!
//! A [`FactorGraph`] is a bipartite graph of variables and factors held in
//! index arenas: [`VarId`], [`FactorId`], and [`EdgeId`] are plain handles
//! with explicit adjacency lists on both sides. Topology is immutable once
//! built; the only way to "change" a graph is [`FactorGraph::clamped`],
//! which conditions on a partial assignment and returns a **new** reduced
//! graph:
//!
//! - tabular factors lose their clamped variables (tables and feature
//!   vectors are sliced, original feature indices preserved),
//! - fully clamped factors fold into nullary constants,
//! - a partially clamped global factor is a fatal error — no well-defined
//!   message algorithm exists for it,
//! - clamped variables stay in the arena with a recorded fixed state, so
//!   belief readout and gradient bookkeeping remain uniform.

use tracing::warn;

use crate::error::InferError;
use crate::factor::{ExpFamilyFactor, ExplicitFactor, Factor, GlobalFactor};
use crate::var::{Var, VarId};
use crate::varset::{VarConfig, VarSet};

/// Index of a factor within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactorId(pub usize);

/// Index of a (factor, variable) edge within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// One incidence between a factor and a variable. `slot` is the
/// variable's position in the factor's [`VarSet`].
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub factor: FactorId,
    pub var: VarId,
    pub slot: usize,
}

#[derive(Debug, Clone)]
struct VarEntry {
    var: Var,
    fixed: Option<usize>,
}

/// Bipartite graph of variables and factors.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    vars: Vec<VarEntry>,
    factors: Vec<Factor>,
    edges: Vec<Edge>,
    var_edges: Vec<Vec<EdgeId>>,
    factor_edges: Vec<Vec<EdgeId>>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(&mut self, var: Var) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(VarEntry { var, fixed: None });
        self.var_edges.push(Vec::new());
        id
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0].var
    }

    pub fn var_ids(&self) -> impl Iterator<Item = VarId> {
        (0..self.vars.len()).map(VarId)
    }

    pub fn factor_ids(&self) -> impl Iterator<Item = FactorId> {
        (0..self.factors.len()).map(FactorId)
    }

    pub fn factor(&self, id: FactorId) -> &Factor {
        &self.factors[id.0]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    /// Edges incident to a variable.
    pub fn var_edges(&self, id: VarId) -> &[EdgeId] {
        &self.var_edges[id.0]
    }

    /// Edges incident to a factor, ordered by slot.
    pub fn factor_edges(&self, id: FactorId) -> &[EdgeId] {
        &self.factor_edges[id.0]
    }

    /// The clamped state of a variable, if any.
    pub fn fixed_state(&self, id: VarId) -> Option<usize> {
        self.vars[id.0].fixed
    }

    pub fn num_states(&self, id: VarId) -> usize {
        self.vars[id.0].var.num_states()
    }

    /// Capture a [`VarSet`] over graph variables.
    pub fn var_set(&self, ids: &[VarId]) -> Result<VarSet, InferError> {
        let mut pairs = Vec::with_capacity(ids.len());
        for &id in ids {
            let entry = self.vars.get(id.0).ok_or(InferError::UnknownVar {
                var: id,
                count: self.vars.len(),
            })?;
            pairs.push((id, entry.var.num_states()));
        }
        Ok(VarSet::new(pairs))
    }

    /// Add a factor, wiring one edge per variable in its set.
    pub fn add_factor(&mut self, factor: Factor) -> Result<FactorId, InferError> {
        let vars = factor.vars().clone();
        for (pos, &vid) in vars.ids().iter().enumerate() {
            let entry = self.vars.get(vid.0).ok_or(InferError::UnknownVar {
                var: vid,
                count: self.vars.len(),
            })?;
            if entry.var.num_states() != vars.arity(pos) {
                return Err(InferError::ArityMismatch {
                    var: vid,
                    captured: vars.arity(pos),
                    actual: entry.var.num_states(),
                });
            }
            if entry.fixed.is_some() {
                return Err(InferError::InvalidConfig(format!(
                    "variable {vid} is clamped and cannot join a new factor"
                )));
            }
        }

        let fid = FactorId(self.factors.len());
        self.factors.push(factor);
        self.factor_edges.push(Vec::new());
        for (slot, &vid) in vars.ids().iter().enumerate() {
            let eid = EdgeId(self.edges.len());
            self.edges.push(Edge {
                factor: fid,
                var: vid,
                slot,
            });
            self.var_edges[vid.0].push(eid);
            self.factor_edges[fid.0].push(eid);
        }
        Ok(fid)
    }

    fn validate_config(&self, config: &VarConfig) -> Result<(), InferError> {
        for (id, state) in config.iter() {
            let entry = self.vars.get(id.0).ok_or(InferError::UnknownVar {
                var: id,
                count: self.vars.len(),
            })?;
            let arity = entry.var.num_states();
            if state >= arity {
                return Err(InferError::StateOutOfRange {
                    var: id,
                    state,
                    arity,
                });
            }
            if let Some(fixed) = entry.fixed {
                if fixed != state {
                    return Err(InferError::InvalidConfig(format!(
                        "variable {id} is already clamped to state {fixed}, cannot re-clamp to {state}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Condition the graph on a partial assignment, returning a new
    /// reduced graph. See the module docs for the transformation rules.
    pub fn clamped(&self, config: &VarConfig) -> Result<FactorGraph, InferError> {
        self.validate_config(config)?;

        let mut out = FactorGraph::new();
        for (ix, entry) in self.vars.iter().enumerate() {
            let id = out.add_var(entry.var.clone());
            out.vars[id.0].fixed = entry.fixed.or_else(|| config.get(VarId(ix)));
        }

        for (ix, factor) in self.factors.iter().enumerate() {
            let vars = factor.vars();
            let fixed: Vec<Option<usize>> =
                vars.ids().iter().map(|&id| config.get(id)).collect();
            let num_fixed = fixed.iter().filter(|f| f.is_some()).count();

            let reduced = if num_fixed == 0 {
                factor.clone()
            } else if num_fixed == vars.len() {
                self.fold_factor(ix, factor, config)
            } else {
                self.slice_factor(ix, factor, &fixed)?
            };
            out.add_factor(reduced)?;
        }
        Ok(out)
    }

    /// A factor with every variable clamped becomes a nullary constant
    /// (exponential-family factors keep their gold-configuration features
    /// so gradients still flow).
    fn fold_factor(&self, index: usize, factor: &Factor, config: &VarConfig) -> Factor {
        match factor {
            Factor::Explicit(f) => {
                let idx = f.vars().config_index(config);
                Factor::Explicit(ExplicitFactor::constant(f.log_potentials().get_flat(idx)))
            }
            Factor::ExpFamily(f) => {
                let idx = f.vars().config_index(config);
                Factor::ExpFamily(ExpFamilyFactor::new(
                    VarSet::empty(),
                    vec![f.features()[idx].clone()],
                ))
            }
            Factor::Global(g) => {
                let score = g.log_unnormalized_score(config);
                if score == f64::NEG_INFINITY {
                    warn!(
                        factor = index,
                        "clamped assignment is not a valid structure; partition will be -inf"
                    );
                }
                Factor::Explicit(ExplicitFactor::constant(score))
            }
        }
    }

    /// Slice a tabular factor down to its unclamped variables.
    fn slice_factor(
        &self,
        index: usize,
        factor: &Factor,
        fixed: &[Option<usize>],
    ) -> Result<Factor, InferError> {
        let vars = factor.vars();
        let kept: Vec<(VarId, usize)> = vars
            .ids()
            .iter()
            .enumerate()
            .filter(|(pos, _)| fixed[*pos].is_none())
            .map(|(pos, &id)| (id, vars.arity(pos)))
            .collect();
        let reduced_set = VarSet::new(kept);

        // Map a reduced configuration index onto the original table.
        let orig_index = |reduced_index: usize| -> usize {
            let mut remaining = reduced_index;
            // Decode reduced states positionally (most significant first).
            let mut reduced_states = vec![0usize; reduced_set.len()];
            for pos in (0..reduced_set.len()).rev() {
                reduced_states[pos] = remaining % reduced_set.arity(pos);
                remaining /= reduced_set.arity(pos);
            }
            let mut full = 0;
            let mut next_reduced = 0;
            for (pos, fix) in fixed.iter().enumerate() {
                let state = match fix {
                    Some(s) => *s,
                    None => {
                        let s = reduced_states[next_reduced];
                        next_reduced += 1;
                        s
                    }
                };
                full = full * vars.arity(pos) + state;
            }
            full
        };

        match factor {
            Factor::Explicit(f) => {
                let table = (0..reduced_set.num_configs())
                    .map(|rc| f.log_potentials().get_flat(orig_index(rc)))
                    .collect();
                Ok(Factor::Explicit(ExplicitFactor::new(reduced_set, table)))
            }
            Factor::ExpFamily(f) => {
                let features = (0..reduced_set.num_configs())
                    .map(|rc| f.features()[orig_index(rc)].clone())
                    .collect();
                Ok(Factor::ExpFamily(ExpFamilyFactor::new(reduced_set, features)))
            }
            Factor::Global(_) => Err(InferError::PartiallyClampedGlobalFactor { factor: index }),
        }
    }
}
