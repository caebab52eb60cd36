//! # Exact inference by enumeration
//!
//! Brute-force evaluation of the full joint over every total
//! configuration of a graph's free variables. Exponential in the number
//! of variables — suitable only for small graphs — but it scores global
//! factors through the same `log_unnormalized_score` contract as
//! everything else, which makes it the reference oracle the
//! message-passing and dynamic-program code is tested against.

use marginalia_core::log_add;

use crate::error::InferError;
use crate::graph::FactorGraph;
use crate::var::VarId;
use crate::varset::{VarConfig, VarSet};

/// The fully enumerated joint distribution over a graph's free variables.
#[derive(Debug, Clone)]
pub struct JointTable {
    vars: VarSet,
    log_weights: Vec<f64>,
    log_partition: f64,
}

impl JointTable {
    pub fn vars(&self) -> &VarSet {
        &self.vars
    }

    /// Natural log of the partition function.
    pub fn log_partition(&self) -> f64 {
        self.log_partition
    }

    /// Unnormalized natural-log weight of one total configuration.
    pub fn log_weight(&self, config: &VarConfig) -> f64 {
        self.log_weights[self.vars.config_index(config)]
    }

    /// Real-space marginal distribution of one variable.
    pub fn marginal(&self, var: VarId) -> Vec<f64> {
        let pos = self
            .vars
            .position(var)
            .expect("variable not in enumeration");
        let mut masses = vec![f64::NEG_INFINITY; self.vars.arity(pos)];
        for (index, &lw) in self.log_weights.iter().enumerate() {
            let state = self.vars.state_at(index, pos);
            masses[state] = log_add(masses[state], lw);
        }
        masses
            .into_iter()
            .map(|m| (m - self.log_partition).exp())
            .collect()
    }
}

/// Enumerate the joint over all free variables of the graph. Clamped
/// variables are excluded (their factors were folded by clamping).
pub fn enumerate_joint(
    fg: &FactorGraph,
    params: Option<&[f64]>,
) -> Result<JointTable, InferError> {
    let free: Vec<VarId> = fg
        .var_ids()
        .filter(|&v| fg.fixed_state(v).is_none())
        .collect();
    let vars = fg.var_set(&free)?;

    let mut log_weights = Vec::with_capacity(vars.num_configs());
    let mut log_partition = f64::NEG_INFINITY;
    for index in 0..vars.num_configs() {
        let config = vars.config(index);
        let mut lw = 0.0;
        for (i, fid) in fg.factor_ids().enumerate() {
            let factor = fg.factor(fid);
            let local = config.restricted(|id| factor.vars().contains(id));
            lw += factor.log_unnormalized_score(i, &local, params)?;
            if lw == f64::NEG_INFINITY {
                break;
            }
        }
        log_partition = log_add(log_partition, lw);
        log_weights.push(lw);
    }

    Ok(JointTable {
        vars,
        log_weights,
        log_partition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::{ExplicitFactor, Factor};
    use crate::var::{Var, VarKind};

    #[test]
    fn matches_hand_computed_joint() {
        let mut fg = FactorGraph::new();
        let a = fg.add_var(Var::binary("a", VarKind::Predicted));
        let b = fg.add_var(Var::binary("b", VarKind::Predicted));
        let vs = fg.var_set(&[a, b]).unwrap();
        fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(
            vs,
            &[1.0, 2.0, 3.0, 4.0],
        )))
        .unwrap();

        let joint = enumerate_joint(&fg, None).unwrap();
        assert!((joint.log_partition() - 10.0f64.ln()).abs() < 1e-12);
        let pa = joint.marginal(a);
        assert!((pa[1] - 0.7).abs() < 1e-12);
        let pb = joint.marginal(b);
        assert!((pb[1] - 0.6).abs() < 1e-12);
    }
}
