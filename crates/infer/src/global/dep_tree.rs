//! # Projective dependency tree factor
//!
//! [`ProjDepTreeFactor`] constrains O(n²) boolean link variables to form
//! exactly one valid projective dependency tree rooted at a virtual wall
//! to the left of the sentence. There is no table: exact per-edge
//! marginals and the partition over all trees come from a first-order
//! Eisner inside-outside dynamic program in O(n³), run over the odds
//! ratios of the incoming messages.
//!
//! The dynamic program is an [`ExternOp`] inside the shared message
//! pipeline, with a hand-written reverse sweep, so the autodiff engine
//! differentiates through it like any other module.
//!
//! Chart conventions (positions `0..=n`, 0 is the wall):
//!
//! - `ir[s][t]` / `il[s][t]`: incomplete spans, arc `s → t` / `t → s`;
//! - `cr[s][t]` / `cl[s][t]`: complete spans headed at `s` / at `t`;
//! - `sp[s][t]`: the shared spine sum `⊕_r cr[s][r] ⊗ cl[r+1][t]`.
//!
//! With `single_root` (the default), the wall takes exactly one child and
//! the partition is assembled from token-only charts; otherwise plain
//! Eisner over `0..=n` allows several wall children.

use std::sync::Arc;

use marginalia_core::{Algebra, Tensor};
use marginalia_diff::ops::ExternOp;

use crate::error::InferError;
use crate::factor::{Factor, GlobalFactor, GlobalOutput};
use crate::graph::{FactorGraph, FactorId};
use crate::var::{Var, VarId, TRUE};
use crate::varset::{VarConfig, VarSet};

use super::{build_pipeline, structured_messages, MessagePipeline};

/// Link variables created by [`ProjDepTreeFactor::attach`].
#[derive(Debug, Clone)]
pub struct DepLinks {
    /// `wall[c]`: the wall → token `c` link.
    pub wall: Vec<VarId>,
    /// `child_of[p][c]`: the token `p` → token `c` link (`None` on the
    /// diagonal).
    pub child_of: Vec<Vec<Option<VarId>>>,
}

impl DepLinks {
    /// The link variable for `parent → child` (`None` parent = wall).
    pub fn link(&self, parent: Option<usize>, child: usize) -> VarId {
        match parent {
            None => self.wall[child],
            Some(p) => self.child_of[p][child].expect("self-loop has no link variable"),
        }
    }
}

/// Global factor enforcing a projective dependency tree over link
/// variables.
#[derive(Debug)]
pub struct ProjDepTreeFactor {
    n: usize,
    single_root: bool,
    vars: VarSet,
    links: Vec<(Option<usize>, usize)>,
    op: Arc<DepTreeOp>,
}

impl ProjDepTreeFactor {
    /// Create the link variables for `n` tokens, attach the factor, and
    /// return the factor id, the link-variable map, and a handle to the
    /// factor itself (for its pipeline and marginal helpers).
    pub fn attach(
        fg: &mut FactorGraph,
        n: usize,
        single_root: bool,
    ) -> Result<(FactorId, DepLinks, Arc<ProjDepTreeFactor>), InferError> {
        assert!(n >= 1, "dependency factor needs at least one token");

        let mut ids = Vec::new();
        let mut links = Vec::new();
        let wall: Vec<VarId> = (0..n)
            .map(|c| {
                let id = fg.add_var(Var::link(None, c));
                ids.push(id);
                links.push((None, c));
                id
            })
            .collect();
        let mut child_of = vec![vec![None; n]; n];
        for p in 0..n {
            for c in 0..n {
                if p == c {
                    continue;
                }
                let id = fg.add_var(Var::link(Some(p), c));
                ids.push(id);
                links.push((Some(p), c));
                child_of[p][c] = Some(id);
            }
        }

        let vars = fg.var_set(&ids)?;
        let op = Arc::new(DepTreeOp {
            n,
            single_root,
            links: links.clone(),
        });
        let factor = Arc::new(ProjDepTreeFactor {
            n,
            single_root,
            vars,
            links,
            op,
        });
        let fid = fg.add_factor(Factor::Global(factor.clone()))?;
        Ok((fid, DepLinks { wall, child_of }, factor))
    }

    pub fn num_tokens(&self) -> usize {
        self.n
    }

    pub fn single_root(&self) -> bool {
        self.single_root
    }

    /// The factor's message pipeline over its inside-outside op; inputs
    /// are the FALSE and TRUE message vectors in link order. Useful for
    /// differentiating through the factor's internals.
    pub fn message_pipeline(&self) -> MessagePipeline {
        build_pipeline(self.op.clone(), self.links.len())
    }

    /// Inside-outside over explicit edge weights (one per link, in link
    /// order): real-space sums over all trees containing each link, plus
    /// the log partition. Exposed for decoding and tests.
    pub fn edge_marginals(&self, weights: &Tensor) -> (Vec<f64>, f64) {
        let alg = weights.algebra();
        let out = self.op.forward(&[weights]);
        let e = self.links.len();
        let sums = (0..e).map(|i| alg.to_real(out.get_flat(i))).collect();
        (sums, alg.to_log_prob(out.get_flat(e)))
    }
}

impl GlobalFactor for ProjDepTreeFactor {
    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn compute_messages(&self, incoming: &[Tensor]) -> Result<GlobalOutput, InferError> {
        structured_messages(self.op.clone(), incoming)
    }

    fn log_unnormalized_score(&self, config: &VarConfig) -> f64 {
        let zero = f64::NEG_INFINITY;
        // One TRUE parent per child.
        let mut parent: Vec<Option<Option<usize>>> = vec![None; self.n];
        for (e, &(p, c)) in self.links.iter().enumerate() {
            let id = self.vars.ids()[e];
            let state = config
                .get(id)
                .unwrap_or_else(|| panic!("config missing {id}"));
            if state == TRUE {
                if parent[c].is_some() {
                    return zero;
                }
                parent[c] = Some(p);
            }
        }
        if parent.iter().any(|p| p.is_none()) {
            return zero;
        }
        let parent: Vec<Option<usize>> = parent.into_iter().map(|p| p.unwrap()).collect();

        if self.single_root {
            let wall_children = parent.iter().filter(|p| p.is_none()).count();
            if wall_children != 1 {
                return zero;
            }
        }

        // Acyclic: every token reaches the wall.
        for start in 0..self.n {
            let mut current = Some(start);
            for _ in 0..=self.n {
                match current {
                    None => break,
                    Some(tok) => current = parent[tok],
                }
            }
            if current.is_some() {
                return zero;
            }
        }

        // Projective iff no two arcs cross (wall at position 0).
        let arcs: Vec<(usize, usize)> = parent
            .iter()
            .enumerate()
            .map(|(c, p)| {
                let pp = p.map(|p| p + 1).unwrap_or(0);
                let cc = c + 1;
                (pp.min(cc), pp.max(cc))
            })
            .collect();
        for (i, &(a, b)) in arcs.iter().enumerate() {
            for &(c, d) in &arcs[i + 1..] {
                if (a < c && c < b && b < d) || (c < a && a < d && d < b) {
                    return zero;
                }
            }
        }

        0.0
    }
}

/// The Eisner inside-outside dynamic program as a differentiable
/// operation: odds-ratio weights in, per-link sums plus partition out.
#[derive(Debug, Clone)]
struct DepTreeOp {
    n: usize,
    single_root: bool,
    links: Vec<(Option<usize>, usize)>,
}

/// Inside charts plus the spine sums and partition.
struct Inside {
    ir: Vec<f64>,
    il: Vec<f64>,
    cr: Vec<f64>,
    cl: Vec<f64>,
    sp: Vec<f64>,
    z: f64,
}

/// Outside charts, one per inside chart.
struct Outside {
    bir: Vec<f64>,
    bil: Vec<f64>,
    bcr: Vec<f64>,
    bcl: Vec<f64>,
}

impl DepTreeOp {
    fn width(&self) -> usize {
        self.n + 1
    }

    fn at(&self, s: usize, t: usize) -> usize {
        s * self.width() + t
    }

    /// Scatter the flat odds vector into the (n+1)×(n+1) weight matrix;
    /// arcs that have no link variable stay at the additive identity.
    fn weights(&self, alg: Algebra, odds: &Tensor) -> Vec<f64> {
        let w = self.width();
        let mut weights = vec![alg.zero(); w * w];
        for (e, &(p, c)) in self.links.iter().enumerate() {
            let pp = p.map(|p| p + 1).unwrap_or(0);
            weights[self.at(pp, c + 1)] = odds.get_flat(e);
        }
        weights
    }

    fn inside(&self, alg: Algebra, weights: &[f64]) -> Inside {
        let n = self.n;
        let w = self.width();
        let size = w * w;
        let mut ir = vec![alg.zero(); size];
        let mut il = vec![alg.zero(); size];
        let mut cr = vec![alg.zero(); size];
        let mut cl = vec![alg.zero(); size];
        let mut sp = vec![alg.zero(); size];
        for s in 0..w {
            cr[self.at(s, s)] = alg.one();
            cl[self.at(s, s)] = alg.one();
        }

        for width in 1..=n {
            for s in 0..=(n - width) {
                let t = s + width;
                let mut spine = alg.zero();
                for r in s..t {
                    spine = alg.plus(spine, alg.times(cr[self.at(s, r)], cl[self.at(r + 1, t)]));
                }
                sp[self.at(s, t)] = spine;
                ir[self.at(s, t)] = alg.times(spine, weights[self.at(s, t)]);
                il[self.at(s, t)] = alg.times(spine, weights[self.at(t, s)]);

                let mut acc = alg.zero();
                for r in (s + 1)..=t {
                    acc = alg.plus(acc, alg.times(ir[self.at(s, r)], cr[self.at(r, t)]));
                }
                cr[self.at(s, t)] = acc;

                let mut acc = alg.zero();
                for r in s..t {
                    acc = alg.plus(acc, alg.times(cl[self.at(s, r)], il[self.at(r, t)]));
                }
                cl[self.at(s, t)] = acc;
            }
        }

        let z = if self.single_root {
            let mut z = alg.zero();
            for r in 1..=n {
                let term = alg.times(
                    weights[self.at(0, r)],
                    alg.times(cl[self.at(1, r)], cr[self.at(r, n)]),
                );
                z = alg.plus(z, term);
            }
            z
        } else {
            cr[self.at(0, n)]
        };

        Inside {
            ir,
            il,
            cr,
            cl,
            sp,
            z,
        }
    }

    fn outside(&self, alg: Algebra, weights: &[f64], inside: &Inside) -> Outside {
        let n = self.n;
        let w = self.width();
        let size = w * w;
        let mut bir = vec![alg.zero(); size];
        let mut bil = vec![alg.zero(); size];
        let mut bcr = vec![alg.zero(); size];
        let mut bcl = vec![alg.zero(); size];

        if self.single_root {
            for r in 1..=n {
                let i = self.at(1, r);
                bcl[i] = alg.plus(
                    bcl[i],
                    alg.times(weights[self.at(0, r)], inside.cr[self.at(r, n)]),
                );
                let i = self.at(r, n);
                bcr[i] = alg.plus(
                    bcr[i],
                    alg.times(weights[self.at(0, r)], inside.cl[self.at(1, r)]),
                );
            }
        } else {
            bcr[self.at(0, n)] = alg.one();
        }

        for width in (1..=n).rev() {
            for s in 0..=(n - width) {
                let t = s + width;

                // Reverse of the complete-right recurrence.
                let b = bcr[self.at(s, t)];
                if !alg.is_zero(b) {
                    for r in (s + 1)..=t {
                        let i = self.at(s, r);
                        bir[i] = alg.plus(bir[i], alg.times(b, inside.cr[self.at(r, t)]));
                        let i = self.at(r, t);
                        bcr[i] = alg.plus(bcr[i], alg.times(b, inside.ir[self.at(s, r)]));
                    }
                }

                // Reverse of the complete-left recurrence.
                let b = bcl[self.at(s, t)];
                if !alg.is_zero(b) {
                    for r in s..t {
                        let i = self.at(s, r);
                        bcl[i] = alg.plus(bcl[i], alg.times(b, inside.il[self.at(r, t)]));
                        let i = self.at(r, t);
                        bil[i] = alg.plus(bil[i], alg.times(b, inside.cl[self.at(s, r)]));
                    }
                }

                // Both incomplete items share the spine.
                let bspine = alg.plus(
                    alg.times(bir[self.at(s, t)], weights[self.at(s, t)]),
                    alg.times(bil[self.at(s, t)], weights[self.at(t, s)]),
                );
                if !alg.is_zero(bspine) {
                    for r in s..t {
                        let i = self.at(s, r);
                        bcr[i] = alg.plus(bcr[i], alg.times(bspine, inside.cl[self.at(r + 1, t)]));
                        let i = self.at(r + 1, t);
                        bcl[i] = alg.plus(bcl[i], alg.times(bspine, inside.cr[self.at(s, r)]));
                    }
                }
            }
        }

        Outside {
            bir,
            bil,
            bcr,
            bcl,
        }
    }

    /// Sum over all valid trees containing one arc.
    fn arc_sum(
        &self,
        alg: Algebra,
        weights: &[f64],
        inside: &Inside,
        outside: &Outside,
        p: Option<usize>,
        c: usize,
    ) -> f64 {
        let n = self.n;
        let c1 = c + 1;
        match p {
            None if self.single_root => alg.times(
                weights[self.at(0, c1)],
                alg.times(inside.cl[self.at(1, c1)], inside.cr[self.at(c1, n)]),
            ),
            None => alg.times(inside.ir[self.at(0, c1)], outside.bir[self.at(0, c1)]),
            Some(p) => {
                let p1 = p + 1;
                if p1 < c1 {
                    alg.times(inside.ir[self.at(p1, c1)], outside.bir[self.at(p1, c1)])
                } else {
                    alg.times(inside.il[self.at(c1, p1)], outside.bil[self.at(c1, p1)])
                }
            }
        }
    }
}

impl ExternOp for DepTreeOp {
    fn name(&self) -> &str {
        "dep-tree-inside-outside"
    }

    fn forward(&self, inputs: &[&Tensor]) -> Tensor {
        let odds = inputs[0];
        let alg = odds.algebra();
        debug_assert_eq!(odds.len(), self.links.len());

        let weights = self.weights(alg, odds);
        let inside = self.inside(alg, &weights);
        let outside = self.outside(alg, &weights, &inside);

        let mut out = Vec::with_capacity(self.links.len() + 1);
        for &(p, c) in &self.links {
            out.push(self.arc_sum(alg, &weights, &inside, &outside, p, c));
        }
        out.push(inside.z);
        Tensor::vector(alg, out)
    }

    /// Reverse sweep: replay inside and outside, then propagate adjoints
    /// through the marginal assembly, the outside program, the seeds, and
    /// the inside program — in exact reverse order — accumulating into
    /// the weight adjoints.
    fn backward(&self, inputs: &[&Tensor], _output: &Tensor, adjoint: &Tensor) -> Vec<Tensor> {
        let odds = inputs[0];
        let alg = odds.algebra();
        let ga = adjoint.algebra();
        let n = self.n;
        let w = self.width();
        let size = w * w;

        let weights = self.weights(alg, odds);
        let inside = self.inside(alg, &weights);
        let outside = self.outside(alg, &weights, &inside);
        let cv = |x: f64| alg.convert(x, ga);

        let mut a_w = vec![ga.zero(); size];
        let mut a_ir = vec![ga.zero(); size];
        let mut a_il = vec![ga.zero(); size];
        let mut a_cr = vec![ga.zero(); size];
        let mut a_cl = vec![ga.zero(); size];
        let mut a_sp = vec![ga.zero(); size];
        let mut a_bir = vec![ga.zero(); size];
        let mut a_bil = vec![ga.zero(); size];
        let mut a_bcr = vec![ga.zero(); size];
        let mut a_bcl = vec![ga.zero(); size];

        let acc = |slot: &mut f64, term: f64| *slot = ga.plus(*slot, term);

        // Reverse the marginal assembly.
        for (e, &(p, c)) in self.links.iter().enumerate() {
            let adj = adjoint.get_flat(e);
            if ga.is_zero(adj) {
                continue;
            }
            let c1 = c + 1;
            match p {
                None if self.single_root => {
                    let (wi, li, ri) = (self.at(0, c1), self.at(1, c1), self.at(c1, n));
                    acc(
                        &mut a_w[wi],
                        ga.times(adj, cv(alg.times(inside.cl[li], inside.cr[ri]))),
                    );
                    acc(
                        &mut a_cl[li],
                        ga.times(adj, cv(alg.times(weights[wi], inside.cr[ri]))),
                    );
                    acc(
                        &mut a_cr[ri],
                        ga.times(adj, cv(alg.times(weights[wi], inside.cl[li]))),
                    );
                }
                None => {
                    let i = self.at(0, c1);
                    acc(&mut a_ir[i], ga.times(adj, cv(outside.bir[i])));
                    acc(&mut a_bir[i], ga.times(adj, cv(inside.ir[i])));
                }
                Some(p) => {
                    let p1 = p + 1;
                    if p1 < c1 {
                        let i = self.at(p1, c1);
                        acc(&mut a_ir[i], ga.times(adj, cv(outside.bir[i])));
                        acc(&mut a_bir[i], ga.times(adj, cv(inside.ir[i])));
                    } else {
                        let i = self.at(c1, p1);
                        acc(&mut a_il[i], ga.times(adj, cv(outside.bil[i])));
                        acc(&mut a_bil[i], ga.times(adj, cv(inside.il[i])));
                    }
                }
            }
        }

        // Reverse the partition read-out.
        let a_z = adjoint.get_flat(self.links.len());
        if !ga.is_zero(a_z) {
            if self.single_root {
                for r in 1..=n {
                    let (wi, li, ri) = (self.at(0, r), self.at(1, r), self.at(r, n));
                    acc(
                        &mut a_w[wi],
                        ga.times(a_z, cv(alg.times(inside.cl[li], inside.cr[ri]))),
                    );
                    acc(
                        &mut a_cl[li],
                        ga.times(a_z, cv(alg.times(weights[wi], inside.cr[ri]))),
                    );
                    acc(
                        &mut a_cr[ri],
                        ga.times(a_z, cv(alg.times(weights[wi], inside.cl[li]))),
                    );
                }
            } else {
                acc(&mut a_cr[self.at(0, n)], a_z);
            }
        }

        // Reverse the outside sweep: ascending width, reversed span order,
        // spine statements before the complete-span statements.
        for width in 1..=n {
            for s in (0..=(n - width)).rev() {
                let t = s + width;

                let bspine = alg.plus(
                    alg.times(outside.bir[self.at(s, t)], weights[self.at(s, t)]),
                    alg.times(outside.bil[self.at(s, t)], weights[self.at(t, s)]),
                );
                let mut a_bspine = ga.zero();
                for r in s..t {
                    let (ci, li) = (self.at(s, r), self.at(r + 1, t));
                    a_bspine = ga.plus(a_bspine, ga.times(a_bcr[ci], cv(inside.cl[li])));
                    acc(&mut a_cl[li], ga.times(a_bcr[ci], cv(bspine)));
                    a_bspine = ga.plus(a_bspine, ga.times(a_bcl[li], cv(inside.cr[ci])));
                    acc(&mut a_cr[ci], ga.times(a_bcl[li], cv(bspine)));
                }
                acc(
                    &mut a_bir[self.at(s, t)],
                    ga.times(a_bspine, cv(weights[self.at(s, t)])),
                );
                acc(
                    &mut a_w[self.at(s, t)],
                    ga.times(a_bspine, cv(outside.bir[self.at(s, t)])),
                );
                acc(
                    &mut a_bil[self.at(s, t)],
                    ga.times(a_bspine, cv(weights[self.at(t, s)])),
                );
                acc(
                    &mut a_w[self.at(t, s)],
                    ga.times(a_bspine, cv(outside.bil[self.at(s, t)])),
                );

                let b = outside.bcl[self.at(s, t)];
                for r in s..t {
                    let (ci, ii) = (self.at(s, r), self.at(r, t));
                    let (src_c, src_i) = (a_bcl[ci], a_bil[ii]);
                    acc(&mut a_bcl[self.at(s, t)], ga.times(src_c, cv(inside.il[ii])));
                    acc(&mut a_il[ii], ga.times(src_c, cv(b)));
                    acc(&mut a_bcl[self.at(s, t)], ga.times(src_i, cv(inside.cl[ci])));
                    acc(&mut a_cl[ci], ga.times(src_i, cv(b)));
                }

                let b = outside.bcr[self.at(s, t)];
                for r in (s + 1)..=t {
                    let (ii, ci) = (self.at(s, r), self.at(r, t));
                    let (src_i, src_c) = (a_bir[ii], a_bcr[ci]);
                    acc(&mut a_bcr[self.at(s, t)], ga.times(src_i, cv(inside.cr[ci])));
                    acc(&mut a_cr[ci], ga.times(src_i, cv(b)));
                    acc(&mut a_bcr[self.at(s, t)], ga.times(src_c, cv(inside.ir[ii])));
                    acc(&mut a_ir[ii], ga.times(src_c, cv(b)));
                }
            }
        }

        // Reverse the outside seeds.
        if self.single_root {
            for r in 1..=n {
                let (wi, li, ri) = (self.at(0, r), self.at(1, r), self.at(r, n));
                acc(&mut a_w[wi], ga.times(a_bcl[li], cv(inside.cr[ri])));
                acc(&mut a_cr[ri], ga.times(a_bcl[li], cv(weights[wi])));
                acc(&mut a_w[wi], ga.times(a_bcr[ri], cv(inside.cl[li])));
                acc(&mut a_cl[li], ga.times(a_bcr[ri], cv(weights[wi])));
            }
        }

        // Reverse the inside sweep: descending width, complete spans
        // before incomplete spans before the spine.
        for width in (1..=n).rev() {
            for s in (0..=(n - width)).rev() {
                let t = s + width;

                let a_cl_top = a_cl[self.at(s, t)];
                for r in s..t {
                    let (ci, ii) = (self.at(s, r), self.at(r, t));
                    acc(&mut a_cl[ci], ga.times(a_cl_top, cv(inside.il[ii])));
                    acc(&mut a_il[ii], ga.times(a_cl_top, cv(inside.cl[ci])));
                }
                let a_cr_top = a_cr[self.at(s, t)];
                for r in (s + 1)..=t {
                    let (ii, ci) = (self.at(s, r), self.at(r, t));
                    acc(&mut a_ir[ii], ga.times(a_cr_top, cv(inside.cr[ci])));
                    acc(&mut a_cr[ci], ga.times(a_cr_top, cv(inside.ir[ii])));
                }

                let i = self.at(s, t);
                acc(&mut a_sp[i], ga.times(a_il[i], cv(weights[self.at(t, s)])));
                acc(&mut a_w[self.at(t, s)], ga.times(a_il[i], cv(inside.sp[i])));
                acc(&mut a_sp[i], ga.times(a_ir[i], cv(weights[self.at(s, t)])));
                acc(&mut a_w[self.at(s, t)], ga.times(a_ir[i], cv(inside.sp[i])));

                for r in s..t {
                    let (ci, li) = (self.at(s, r), self.at(r + 1, t));
                    acc(&mut a_cr[ci], ga.times(a_sp[i], cv(inside.cl[li])));
                    acc(&mut a_cl[li], ga.times(a_sp[i], cv(inside.cr[ci])));
                }
            }
        }

        // Gather the weight adjoints back into link order.
        let grads = self
            .links
            .iter()
            .map(|&(p, c)| {
                let pp = p.map(|p| p + 1).unwrap_or(0);
                a_w[self.at(pp, c + 1)]
            })
            .collect();
        vec![Tensor::vector(ga, grads)]
    }
}
