//! # Constituency bracketing factor
//!
//! [`ConsTreeFactor`] constrains O(n²) boolean span variables — one per
//! `(start, end)` range over `n` tokens — to be exactly the span set of
//! one full binary bracketing: every width-1 span, the root span, and for
//! every wider TRUE span exactly one split into two TRUE children.
//!
//! Structurally this is the dependency factor with a different embedded
//! dynamic program: a CYK-style inside-outside over the fixed unlabeled
//! binary grammar, O(n³), run on the odds ratios of the incoming
//! messages and differentiated by a hand-written reverse sweep.

use std::collections::HashSet;
use std::sync::Arc;

use marginalia_core::{Algebra, Tensor};
use marginalia_diff::ops::ExternOp;

use crate::error::InferError;
use crate::factor::{Factor, GlobalFactor, GlobalOutput};
use crate::graph::{FactorGraph, FactorId};
use crate::var::{Var, VarId, TRUE};
use crate::varset::{VarConfig, VarSet};

use super::{build_pipeline, structured_messages, MessagePipeline};

/// Span variables created by [`ConsTreeFactor::attach`].
#[derive(Debug, Clone)]
pub struct SpanVars {
    /// `id[i][j]` for the span `i..j` (`None` where `j <= i`).
    pub id: Vec<Vec<Option<VarId>>>,
}

impl SpanVars {
    pub fn span(&self, start: usize, end: usize) -> VarId {
        self.id[start][end].expect("no variable for empty span")
    }
}

/// Global factor enforcing a full binary bracketing over span variables.
#[derive(Debug)]
pub struct ConsTreeFactor {
    n: usize,
    vars: VarSet,
    spans: Vec<(usize, usize)>,
    op: Arc<ConsTreeOp>,
}

impl ConsTreeFactor {
    /// Create the span variables for `n` tokens, attach the factor, and
    /// return the factor id, the span-variable map, and a handle to the
    /// factor itself (for its pipeline and marginal helpers).
    pub fn attach(
        fg: &mut FactorGraph,
        n: usize,
    ) -> Result<(FactorId, SpanVars, Arc<ConsTreeFactor>), InferError> {
        assert!(n >= 1, "bracketing factor needs at least one token");

        let mut ids = Vec::new();
        let mut spans = Vec::new();
        let mut id = vec![vec![None; n + 1]; n + 1];
        for i in 0..n {
            for j in (i + 1)..=n {
                let vid = fg.add_var(Var::span(i, j));
                ids.push(vid);
                spans.push((i, j));
                id[i][j] = Some(vid);
            }
        }

        let vars = fg.var_set(&ids)?;
        let op = Arc::new(ConsTreeOp {
            n,
            spans: spans.clone(),
        });
        let factor = Arc::new(ConsTreeFactor { n, vars, spans, op });
        let fid = fg.add_factor(Factor::Global(factor.clone()))?;
        Ok((fid, SpanVars { id }, factor))
    }

    pub fn num_tokens(&self) -> usize {
        self.n
    }

    /// The factor's message pipeline; see
    /// [`ProjDepTreeFactor::message_pipeline`](super::ProjDepTreeFactor::message_pipeline).
    pub fn message_pipeline(&self) -> MessagePipeline {
        build_pipeline(self.op.clone(), self.spans.len())
    }

    /// Inside-outside over explicit span weights (one per span, in span
    /// order): real-space sums over all bracketings containing each span,
    /// plus the log partition.
    pub fn span_marginals(&self, weights: &Tensor) -> (Vec<f64>, f64) {
        let alg = weights.algebra();
        let out = self.op.forward(&[weights]);
        let e = self.spans.len();
        let sums = (0..e).map(|i| alg.to_real(out.get_flat(i))).collect();
        (sums, alg.to_log_prob(out.get_flat(e)))
    }
}

impl GlobalFactor for ConsTreeFactor {
    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn compute_messages(&self, incoming: &[Tensor]) -> Result<GlobalOutput, InferError> {
        structured_messages(self.op.clone(), incoming)
    }

    fn log_unnormalized_score(&self, config: &VarConfig) -> f64 {
        let zero = f64::NEG_INFINITY;
        let mut on: HashSet<(usize, usize)> = HashSet::new();
        for (e, &(i, j)) in self.spans.iter().enumerate() {
            let id = self.vars.ids()[e];
            let state = config
                .get(id)
                .unwrap_or_else(|| panic!("config missing {id}"));
            if state == TRUE {
                on.insert((i, j));
            }
        }
        // A full binary bracketing of n leaves has exactly 2n - 1 spans.
        if on.len() != 2 * self.n - 1 {
            return zero;
        }
        if self.validates(0, self.n, &on) {
            0.0
        } else {
            zero
        }
    }
}

impl ConsTreeFactor {
    /// Check that `i..j` is in the set and decomposes uniquely into two
    /// TRUE children. Valid bracketings are laminar, so an ambiguous
    /// split can only come from an invalid span set.
    fn validates(&self, i: usize, j: usize, on: &HashSet<(usize, usize)>) -> bool {
        if !on.contains(&(i, j)) {
            return false;
        }
        if j == i + 1 {
            return true;
        }
        let mut split = None;
        for k in (i + 1)..j {
            if on.contains(&(i, k)) && on.contains(&(k, j)) {
                if split.is_some() {
                    return false;
                }
                split = Some(k);
            }
        }
        match split {
            Some(k) => self.validates(i, k, on) && self.validates(k, j, on),
            None => false,
        }
    }
}

/// CYK inside-outside as a differentiable operation: span odds in,
/// per-span sums plus bracketing partition out.
#[derive(Debug, Clone)]
struct ConsTreeOp {
    n: usize,
    spans: Vec<(usize, usize)>,
}

struct ConsCharts {
    /// Inside scores per span.
    inside: Vec<f64>,
    /// Split sums: `s[i][j] = ⊕_k inside[i][k] ⊗ inside[k][j]`.
    splits: Vec<f64>,
    /// Outside scores per span.
    outside: Vec<f64>,
    z: f64,
}

impl ConsTreeOp {
    fn at(&self, i: usize, j: usize) -> usize {
        i * (self.n + 1) + j
    }

    fn weights(&self, alg: Algebra, odds: &Tensor) -> Vec<f64> {
        let size = (self.n + 1) * (self.n + 1);
        let mut weights = vec![alg.zero(); size];
        for (e, &(i, j)) in self.spans.iter().enumerate() {
            weights[self.at(i, j)] = odds.get_flat(e);
        }
        weights
    }

    fn charts(&self, alg: Algebra, weights: &[f64]) -> ConsCharts {
        let n = self.n;
        let size = (n + 1) * (n + 1);
        let mut inside = vec![alg.zero(); size];
        let mut splits = vec![alg.zero(); size];

        for i in 0..n {
            inside[self.at(i, i + 1)] = weights[self.at(i, i + 1)];
        }
        for width in 2..=n {
            for i in 0..=(n - width) {
                let j = i + width;
                let mut s = alg.zero();
                for k in (i + 1)..j {
                    s = alg.plus(s, alg.times(inside[self.at(i, k)], inside[self.at(k, j)]));
                }
                splits[self.at(i, j)] = s;
                inside[self.at(i, j)] = alg.times(weights[self.at(i, j)], s);
            }
        }
        let z = inside[self.at(0, n)];

        let mut outside = vec![alg.zero(); size];
        outside[self.at(0, n)] = alg.one();
        for width in (2..=n).rev() {
            for i in 0..=(n - width) {
                let j = i + width;
                let pre = alg.times(outside[self.at(i, j)], weights[self.at(i, j)]);
                if alg.is_zero(pre) {
                    continue;
                }
                for k in (i + 1)..j {
                    let left = self.at(i, k);
                    let right = self.at(k, j);
                    outside[left] = alg.plus(outside[left], alg.times(pre, inside[right]));
                    outside[right] = alg.plus(outside[right], alg.times(pre, inside[left]));
                }
            }
        }

        ConsCharts {
            inside,
            splits,
            outside,
            z,
        }
    }
}

impl ExternOp for ConsTreeOp {
    fn name(&self) -> &str {
        "cons-tree-inside-outside"
    }

    fn forward(&self, inputs: &[&Tensor]) -> Tensor {
        let odds = inputs[0];
        let alg = odds.algebra();
        debug_assert_eq!(odds.len(), self.spans.len());

        let weights = self.weights(alg, odds);
        let charts = self.charts(alg, &weights);

        let mut out = Vec::with_capacity(self.spans.len() + 1);
        for &(i, j) in &self.spans {
            out.push(alg.times(
                charts.inside[self.at(i, j)],
                charts.outside[self.at(i, j)],
            ));
        }
        out.push(charts.z);
        Tensor::vector(alg, out)
    }

    fn backward(&self, inputs: &[&Tensor], _output: &Tensor, adjoint: &Tensor) -> Vec<Tensor> {
        let odds = inputs[0];
        let alg = odds.algebra();
        let ga = adjoint.algebra();
        let n = self.n;
        let size = (n + 1) * (n + 1);

        let weights = self.weights(alg, odds);
        let charts = self.charts(alg, &weights);
        let cv = |x: f64| alg.convert(x, ga);
        let acc = |slot: &mut f64, term: f64| *slot = ga.plus(*slot, term);

        let mut a_w = vec![ga.zero(); size];
        let mut a_in = vec![ga.zero(); size];
        let mut a_out = vec![ga.zero(); size];

        // Reverse the marginal assembly and partition read-out.
        for (e, &(i, j)) in self.spans.iter().enumerate() {
            let adj = adjoint.get_flat(e);
            if ga.is_zero(adj) {
                continue;
            }
            let s = self.at(i, j);
            acc(&mut a_in[s], ga.times(adj, cv(charts.outside[s])));
            acc(&mut a_out[s], ga.times(adj, cv(charts.inside[s])));
        }
        let a_z = adjoint.get_flat(self.spans.len());
        if !ga.is_zero(a_z) {
            acc(&mut a_in[self.at(0, n)], a_z);
        }

        // Reverse the outside sweep (ascending width).
        for width in 2..=n {
            for i in (0..=(n - width)).rev() {
                let j = i + width;
                let s = self.at(i, j);
                let pre = alg.times(charts.outside[s], weights[s]);
                let mut a_pre = ga.zero();
                for k in (i + 1)..j {
                    let left = self.at(i, k);
                    let right = self.at(k, j);
                    let (src_l, src_r) = (a_out[left], a_out[right]);
                    a_pre = ga.plus(a_pre, ga.times(src_l, cv(charts.inside[right])));
                    acc(&mut a_in[right], ga.times(src_l, cv(pre)));
                    a_pre = ga.plus(a_pre, ga.times(src_r, cv(charts.inside[left])));
                    acc(&mut a_in[left], ga.times(src_r, cv(pre)));
                }
                acc(&mut a_out[s], ga.times(a_pre, cv(weights[s])));
                acc(&mut a_w[s], ga.times(a_pre, cv(charts.outside[s])));
            }
        }

        // Reverse the inside sweep (descending width).
        for width in (2..=n).rev() {
            for i in (0..=(n - width)).rev() {
                let j = i + width;
                let s = self.at(i, j);
                let a_top = a_in[s];
                if ga.is_zero(a_top) {
                    continue;
                }
                acc(&mut a_w[s], ga.times(a_top, cv(charts.splits[s])));
                let a_split = ga.times(a_top, cv(weights[s]));
                for k in (i + 1)..j {
                    let left = self.at(i, k);
                    let right = self.at(k, j);
                    acc(&mut a_in[left], ga.times(a_split, cv(charts.inside[right])));
                    acc(&mut a_in[right], ga.times(a_split, cv(charts.inside[left])));
                }
            }
        }
        for i in 0..n {
            let s = self.at(i, i + 1);
            let a_leaf = a_in[s];
            acc(&mut a_w[s], a_leaf);
        }

        let grads = self
            .spans
            .iter()
            .map(|&(i, j)| a_w[self.at(i, j)])
            .collect();
        vec![Tensor::vector(ga, grads)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: usize) -> ConsTreeOp {
        let mut spans = Vec::new();
        for i in 0..n {
            for j in (i + 1)..=n {
                spans.push((i, j));
            }
        }
        ConsTreeOp { n, spans }
    }

    #[test]
    fn counts_binary_bracketings() {
        // Catalan(n-1) full binary bracketings: 1, 1, 2, 5.
        for (n, expected) in [(1, 1.0), (2, 1.0), (3, 2.0), (4, 5.0)] {
            let op = op(n);
            let odds = Tensor::ones(Algebra::Real, vec![op.spans.len()]);
            let out = op.forward(&[&odds]);
            assert!(
                (out.get_flat(op.spans.len()) - expected).abs() < 1e-9,
                "n = {n}"
            );
        }
    }

    #[test]
    fn span_sums_count_containing_bracketings() {
        // n = 3: bracketings ((12)3) and (1(23)).
        let op = op(3);
        let odds = Tensor::ones(Algebra::Real, vec![op.spans.len()]);
        let out = op.forward(&[&odds]);
        for (e, &(i, j)) in op.spans.iter().enumerate() {
            let expected = match (i, j) {
                // Leaves and root are in both bracketings.
                (0, 1) | (1, 2) | (2, 3) | (0, 3) => 2.0,
                // Internal spans appear in exactly one.
                (0, 2) | (1, 3) => 1.0,
                _ => unreachable!(),
            };
            assert!((out.get_flat(e) - expected).abs() < 1e-9, "span {i}..{j}");
        }
    }

    #[test]
    fn real_and_log_agree() {
        let op = op(3);
        let e = op.spans.len();
        let reals: Vec<f64> = (0..e).map(|i| 0.5 + 0.2 * (i as f64)).collect();
        let real_out = op.forward(&[&Tensor::from_reals(Algebra::Real, &reals)]);
        let log_out = op.forward(&[&Tensor::from_reals(Algebra::Log, &reals)]);
        for i in 0..=e {
            let a = real_out.get_flat(i);
            let b = Algebra::Log.to_real(log_out.get_flat(i));
            assert!((a - b).abs() < 1e-9 * a.abs().max(1.0));
        }
    }
}
