//! # Belief propagation
//!
//! Sum-product message passing over a [`FactorGraph`]. Every edge carries
//! two directional messages (variable→factor and factor→variable), each
//! double-buffered: fresh values are staged and committed either per
//! message ([`UpdateOrder::Sequential`]) or at sweep end
//! ([`UpdateOrder::Parallel`]).
//!
//! Two schedules:
//!
//! - [`BpSchedule::TreeLike`] — a leaf→root→leaf elimination order, exact
//!   in one pass on acyclic graphs (an error on cyclic ones).
//! - [`BpSchedule::Flood`] — every edge fires each iteration under a fixed
//!   budget; on cyclic graphs this is loopy BP and approximate. The
//!   baseline stopping rule is the iteration budget;
//!   `convergence_tolerance` is an optional early exit.
//!
//! Messages are kept unnormalized: the log-domain algebra absorbs the
//! dynamic range, and the partition function can then be read off any
//! node ([`BeliefPropagation::log_partition_at_var`] /
//! [`log_partition_at_factor`](BeliefPropagation::log_partition_at_factor)),
//! with all readings agreeing on a converged acyclic graph.
//!
//! Global factors compute all of their outgoing messages in a single call;
//! a per-factor iteration stamp prevents duplicate recomputation when
//! several incident edges trigger the same factor within one sweep.

use marginalia_core::{Algebra, Tensor};

use crate::error::InferError;
use crate::factor::{Factor, GlobalFactor, StructuredDiagnostics};
use crate::graph::{EdgeId, FactorGraph, FactorId};
use crate::var::VarId;

/// Which schedule drives message updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BpSchedule {
    /// Two-pass tree elimination order; exact on acyclic graphs.
    #[default]
    TreeLike,
    /// Fire every edge each iteration (loopy BP on cyclic graphs).
    Flood,
}

/// When freshly computed messages become visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateOrder {
    /// Each message is committed as soon as it is computed.
    #[default]
    Sequential,
    /// All messages of a sweep are computed from the pre-sweep state and
    /// committed together.
    Parallel,
}

/// Belief propagation configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpConfig {
    pub algebra: Algebra,
    pub schedule: BpSchedule,
    pub update_order: UpdateOrder,
    /// Iteration budget for the flood schedule.
    pub max_iterations: usize,
    /// Optional early exit when the max message delta (in probability
    /// space) falls below this threshold.
    pub convergence_tolerance: Option<f64>,
    /// Geometric damping factor in [0, 1) for flood sweeps; 0 disables.
    pub damping: f64,
}

impl Default for BpConfig {
    fn default() -> Self {
        Self {
            algebra: Algebra::Log,
            schedule: BpSchedule::TreeLike,
            update_order: UpdateOrder::Sequential,
            max_iterations: 50,
            convergence_tolerance: None,
            damping: 0.0,
        }
    }
}

impl BpConfig {
    pub fn validate(&self) -> Result<(), InferError> {
        if self.max_iterations == 0 {
            return Err(InferError::InvalidConfig(
                "max_iterations must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.damping) {
            return Err(InferError::InvalidConfig(
                "damping must be in [0, 1)".into(),
            ));
        }
        if let Some(tol) = self.convergence_tolerance {
            if tol <= 0.0 || !tol.is_finite() {
                return Err(InferError::InvalidConfig(
                    "convergence_tolerance must be finite and > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Runtime diagnostics for one inference run.
#[derive(Debug, Clone, Default)]
pub struct BpDiagnostics {
    pub iterations_run: usize,
    pub converged: bool,
    pub final_max_delta: f64,
    pub message_updates: usize,
    pub structured: StructuredDiagnostics,
}

/// Marginals and log partition produced by inference.
#[derive(Debug, Clone)]
pub struct Beliefs {
    /// Normalized per-variable marginals (point masses for clamped
    /// variables, uniform for isolated free variables).
    pub var_beliefs: Vec<Tensor>,
    /// Normalized per-factor marginals over factor configurations; `None`
    /// for global factors, whose domains are not enumerable.
    pub factor_beliefs: Vec<Option<Tensor>>,
    /// Natural log of the partition function of the whole graph.
    pub log_partition: f64,
}

impl Beliefs {
    /// Real-space marginal of one variable.
    pub fn var_marginal(&self, var: VarId) -> Vec<f64> {
        self.var_beliefs[var.0].to_reals()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgDir {
    VarToFactor,
    FactorToVar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Var(usize),
    Factor(usize),
}

/// The message-passing engine. Owns all per-edge message state for one
/// inference run over a borrowed graph.
#[derive(Debug)]
pub struct BeliefPropagation<'a> {
    fg: &'a FactorGraph,
    config: BpConfig,
    /// Materialized potentials in the run algebra; `None` for global
    /// factors.
    potentials: Vec<Option<Tensor>>,
    to_var: Vec<Tensor>,
    to_factor: Vec<Tensor>,
    staged_to_var: Vec<Option<Tensor>>,
    staged_to_factor: Vec<Option<Tensor>>,
    factor_stamp: Vec<Option<usize>>,
    diagnostics: BpDiagnostics,
    /// Component id per variable (vars with edges only).
    var_component: Vec<Option<usize>>,
    num_components: usize,
}

impl<'a> BeliefPropagation<'a> {
    pub fn new(
        fg: &'a FactorGraph,
        params: Option<&[f64]>,
        config: BpConfig,
    ) -> Result<Self, InferError> {
        config.validate()?;

        let mut potentials = Vec::with_capacity(fg.num_factors());
        for (i, fid) in fg.factor_ids().enumerate() {
            let pot = fg
                .factor(fid)
                .log_potentials(i, params)?
                .map(|t| t.to_algebra(config.algebra));
            potentials.push(pot);
        }

        let ones = |var: VarId| {
            Tensor::ones(config.algebra, vec![fg.num_states(var)])
        };
        let to_var: Vec<Tensor> = (0..fg.num_edges())
            .map(|e| ones(fg.edge(EdgeId(e)).var))
            .collect();
        let to_factor = to_var.clone();

        let (var_component, num_components) = components(fg);

        Ok(Self {
            fg,
            config,
            potentials,
            to_var,
            to_factor,
            staged_to_var: vec![None; fg.num_edges()],
            staged_to_factor: vec![None; fg.num_edges()],
            factor_stamp: vec![None; fg.num_factors()],
            diagnostics: BpDiagnostics::default(),
            var_component,
            num_components,
        })
    }

    /// Run inference to completion and read out beliefs.
    pub fn run(&mut self) -> Result<(Beliefs, BpDiagnostics), InferError> {
        match self.config.schedule {
            BpSchedule::TreeLike => {
                // The elimination order is exact only when each message is
                // visible to the next; parallel staging is a flood concern.
                let requested = self.config.update_order;
                self.config.update_order = UpdateOrder::Sequential;
                let (up, down) = tree_order(self.fg)?;
                let d1 = self.sweep(&up, 0)?;
                let d2 = self.sweep(&down, 1)?;
                self.config.update_order = requested;
                self.diagnostics.iterations_run = 1;
                self.diagnostics.converged = true;
                self.diagnostics.final_max_delta = d1.max(d2);
            }
            BpSchedule::Flood => {
                let order = flood_order(self.fg);
                for iteration in 0..self.config.max_iterations {
                    let delta = self.sweep(&order, iteration)?;
                    self.diagnostics.iterations_run = iteration + 1;
                    self.diagnostics.final_max_delta = delta;
                    if let Some(tol) = self.config.convergence_tolerance {
                        if delta < tol {
                            self.diagnostics.converged = true;
                            break;
                        }
                    }
                }
            }
        }
        Ok((self.beliefs()?, self.diagnostics.clone()))
    }

    /// One pass over `msgs`; returns the max per-message probability delta.
    fn sweep(&mut self, msgs: &[(EdgeId, MsgDir)], iteration: usize) -> Result<f64, InferError> {
        let mut max_delta = 0.0f64;
        for &(edge, dir) in msgs {
            match dir {
                MsgDir::VarToFactor => {
                    let fresh = self.compute_var_to_factor(edge);
                    let delta = self.stage(edge, MsgDir::VarToFactor, fresh);
                    max_delta = max_delta.max(delta);
                }
                MsgDir::FactorToVar => {
                    let fid = self.fg.edge(edge).factor;
                    if self.fg.factor(fid).is_global() {
                        if self.factor_stamp[fid.0] != Some(iteration) {
                            self.factor_stamp[fid.0] = Some(iteration);
                            let delta = self.expand_global(fid)?;
                            max_delta = max_delta.max(delta);
                        }
                    } else {
                        let fresh = self.compute_factor_to_var(edge);
                        let delta = self.stage(edge, MsgDir::FactorToVar, fresh);
                        max_delta = max_delta.max(delta);
                    }
                }
            }
        }
        if self.config.update_order == UpdateOrder::Parallel {
            self.commit_staged();
        }
        Ok(max_delta)
    }

    /// Product of all incoming factor→var messages except this factor's,
    /// computed as belief ÷ incoming. A zero incoming entry zeroes the
    /// belief entry too, and the algebra's zero-numerator division rule
    /// propagates zero instead of NaN. Where the incoming entry itself is
    /// zero the ratio would only echo this factor's own constraint back
    /// at it, so those entries are recomputed as the exclusive product
    /// over the other factors — a state truly forbidden elsewhere still
    /// comes out zero.
    fn compute_var_to_factor(&self, edge: EdgeId) -> Tensor {
        let alg = self.config.algebra;
        let var = self.fg.edge(edge).var;
        let incoming = &self.to_var[edge.0];
        let belief = self.raw_var_belief(var);
        let mut msg = belief.divide(incoming);
        for s in 0..msg.len() {
            if alg.is_zero(incoming.get_flat(s)) {
                let mut exclusive = alg.one();
                for &other in self.fg.var_edges(var) {
                    if other != edge {
                        exclusive = alg.times(exclusive, self.to_var[other.0].get_flat(s));
                    }
                }
                msg.set_flat(s, exclusive);
            }
        }
        msg
    }

    /// Semiring-sum over the factor's other variables of potential times
    /// incoming messages.
    fn compute_factor_to_var(&self, edge: EdgeId) -> Tensor {
        let alg = self.config.algebra;
        let e = self.fg.edge(edge);
        let factor = self.fg.factor(e.factor);
        let vars = factor.vars();
        let pot = self.potentials[e.factor.0]
            .as_ref()
            .expect("tabular factor has potentials");
        let edges = self.fg.factor_edges(e.factor);

        let mut out = Tensor::zeros(alg, vec![vars.arity(e.slot)]);
        let mut states = vec![0usize; vars.len()];
        for config in 0..vars.num_configs() {
            let mut term = pot.get_flat(config);
            for (slot, &edge_id) in edges.iter().enumerate() {
                if slot == e.slot {
                    continue;
                }
                term = alg.times(term, self.to_factor[edge_id.0].get_flat(states[slot]));
            }
            let target = states[e.slot];
            out.set_flat(target, alg.plus(out.get_flat(target), term));

            // Mixed-radix odometer, last position fastest.
            for pos in (0..states.len()).rev() {
                states[pos] += 1;
                if states[pos] < vars.arity(pos) {
                    break;
                }
                states[pos] = 0;
            }
        }
        out
    }

    /// Compute all outgoing messages of a global factor at once.
    fn expand_global(&mut self, fid: FactorId) -> Result<f64, InferError> {
        let Factor::Global(global) = self.fg.factor(fid) else {
            return Err(InferError::Internal("expand_global on tabular factor".into()));
        };
        let edges: Vec<EdgeId> = self.fg.factor_edges(fid).to_vec();
        let incoming: Vec<Tensor> = edges
            .iter()
            .map(|&e| self.to_factor[e.0].clone())
            .collect();
        let output = global.compute_messages(&incoming)?;
        debug_assert_eq!(output.messages.len(), edges.len());
        self.diagnostics.structured.merge(&output.diagnostics);

        let mut max_delta = 0.0f64;
        for (slot, fresh) in output.messages.into_iter().enumerate() {
            let delta = self.stage(edges[slot], MsgDir::FactorToVar, fresh);
            max_delta = max_delta.max(delta);
        }
        Ok(max_delta)
    }

    /// Stage a fresh message; under sequential update order it is
    /// committed immediately. Returns the probability-space delta.
    fn stage(&mut self, edge: EdgeId, dir: MsgDir, fresh: Tensor) -> f64 {
        let current = match dir {
            MsgDir::VarToFactor => &self.to_factor[edge.0],
            MsgDir::FactorToVar => &self.to_var[edge.0],
        };
        let fresh = if self.config.damping > 0.0 && self.config.schedule == BpSchedule::Flood {
            damp(current, &fresh, self.config.damping)
        } else {
            fresh
        };
        let delta = prob_delta(current, &fresh);
        self.diagnostics.message_updates += 1;
        match (self.config.update_order, dir) {
            (UpdateOrder::Sequential, MsgDir::VarToFactor) => self.to_factor[edge.0] = fresh,
            (UpdateOrder::Sequential, MsgDir::FactorToVar) => self.to_var[edge.0] = fresh,
            (UpdateOrder::Parallel, MsgDir::VarToFactor) => {
                self.staged_to_factor[edge.0] = Some(fresh)
            }
            (UpdateOrder::Parallel, MsgDir::FactorToVar) => {
                self.staged_to_var[edge.0] = Some(fresh)
            }
        }
        delta
    }

    fn commit_staged(&mut self) {
        for (e, staged) in self.staged_to_var.iter_mut().enumerate() {
            if let Some(fresh) = staged.take() {
                self.to_var[e] = fresh;
            }
        }
        for (e, staged) in self.staged_to_factor.iter_mut().enumerate() {
            if let Some(fresh) = staged.take() {
                self.to_factor[e] = fresh;
            }
        }
    }

    /// Unnormalized product of all incoming messages at a variable.
    fn raw_var_belief(&self, var: VarId) -> Tensor {
        let mut belief = Tensor::ones(self.config.algebra, vec![self.fg.num_states(var)]);
        for &e in self.fg.var_edges(var) {
            belief = belief.times(&self.to_var[e.0]);
        }
        belief
    }

    /// Unnormalized factor belief over configurations (tabular factors).
    fn raw_factor_belief(&self, fid: FactorId) -> Tensor {
        let alg = self.config.algebra;
        let factor = self.fg.factor(fid);
        let vars = factor.vars();
        let pot = self.potentials[fid.0].as_ref().expect("tabular factor");
        let edges = self.fg.factor_edges(fid);

        let mut out = Tensor::zeros(alg, vec![vars.num_configs()]);
        let mut states = vec![0usize; vars.len()];
        for config in 0..vars.num_configs() {
            let mut term = pot.get_flat(config);
            for (slot, &edge_id) in edges.iter().enumerate() {
                term = alg.times(term, self.to_factor[edge_id.0].get_flat(states[slot]));
            }
            out.set_flat(config, term);
            for pos in (0..states.len()).rev() {
                states[pos] += 1;
                if states[pos] < vars.arity(pos) {
                    break;
                }
                states[pos] = 0;
            }
        }
        out
    }

    /// Contributions outside any connected component: nullary factor
    /// constants plus the free measure of isolated variables.
    fn log_extras(&self) -> f64 {
        let alg = self.config.algebra;
        let mut extras = 0.0;
        for fid in self.fg.factor_ids() {
            if self.fg.factor_edges(fid).is_empty() {
                if let Some(pot) = &self.potentials[fid.0] {
                    extras += alg.to_log_prob(pot.get_flat(0));
                }
            }
        }
        for v in self.fg.var_ids() {
            if self.fg.var_edges(v).is_empty() && self.fg.fixed_state(v).is_none() {
                extras += (self.fg.num_states(v) as f64).ln();
            }
        }
        extras
    }

    fn component_reading(&self, component: usize) -> f64 {
        let alg = self.config.algebra;
        for v in self.fg.var_ids() {
            if self.var_component[v.0] == Some(component) {
                return alg.to_log_prob(self.raw_var_belief(v).sum());
            }
        }
        0.0
    }

    /// Natural log of the whole graph's partition function.
    pub fn log_partition(&self) -> f64 {
        let mut total = self.log_extras();
        for c in 0..self.num_components {
            total += self.component_reading(c);
        }
        total
    }

    /// The partition function read at one variable node. On a converged
    /// acyclic graph this agrees with every other node's reading.
    pub fn log_partition_at_var(&self, var: VarId) -> f64 {
        let alg = self.config.algebra;
        match self.var_component[var.0] {
            None => self.log_partition(),
            Some(comp) => {
                let mut total = self.log_extras();
                for c in 0..self.num_components {
                    if c != comp {
                        total += self.component_reading(c);
                    }
                }
                total + alg.to_log_prob(self.raw_var_belief(var).sum())
            }
        }
    }

    /// The partition function read at one factor node.
    pub fn log_partition_at_factor(&self, fid: FactorId) -> Result<f64, InferError> {
        let alg = self.config.algebra;
        let edges = self.fg.factor_edges(fid);
        if edges.is_empty() {
            return Ok(self.log_partition());
        }
        let local = if let Factor::Global(global) = self.fg.factor(fid) {
            // Read from the current incoming messages; the value stored at
            // expansion time may predate the final sweep.
            let incoming: Vec<Tensor> = edges
                .iter()
                .map(|&e| self.to_factor[e.0].clone())
                .collect();
            global.compute_messages(&incoming)?.log_partition
        } else {
            alg.to_log_prob(self.raw_factor_belief(fid).sum())
        };
        let comp = self.var_component[self.fg.edge(edges[0]).var.0]
            .ok_or_else(|| InferError::Internal("edge variable missing component".into()))?;
        let mut total = self.log_extras();
        for c in 0..self.num_components {
            if c != comp {
                total += self.component_reading(c);
            }
        }
        Ok(total + local)
    }

    /// Read out normalized beliefs and the log partition.
    fn beliefs(&self) -> Result<Beliefs, InferError> {
        let alg = self.config.algebra;

        let mut var_beliefs = Vec::with_capacity(self.fg.num_vars());
        for v in self.fg.var_ids() {
            let arity = self.fg.num_states(v);
            let belief = if let Some(state) = self.fg.fixed_state(v) {
                let mut t = Tensor::zeros(alg, vec![arity]);
                t.set_flat(state, alg.one());
                t
            } else if self.fg.var_edges(v).is_empty() {
                let mut t = Tensor::ones(alg, vec![arity]);
                t.normalize();
                t
            } else {
                let mut t = self.raw_var_belief(v);
                t.normalize();
                t
            };
            var_beliefs.push(belief);
        }

        let mut factor_beliefs = Vec::with_capacity(self.fg.num_factors());
        for fid in self.fg.factor_ids() {
            if self.fg.factor(fid).is_global() {
                factor_beliefs.push(None);
            } else {
                let mut b = self.raw_factor_belief(fid);
                b.normalize();
                factor_beliefs.push(Some(b));
            }
        }

        Ok(Beliefs {
            var_beliefs,
            factor_beliefs,
            log_partition: self.log_partition(),
        })
    }
}

/// Run inference with the given configuration; convenience wrapper for
/// graphs whose factors need no model parameters.
pub fn run_inference(fg: &FactorGraph, config: &BpConfig) -> Result<Beliefs, InferError> {
    let (beliefs, _) = BeliefPropagation::new(fg, None, *config)?.run()?;
    Ok(beliefs)
}

/// Run inference with model parameters for exponential-family factors.
pub fn run_inference_with_params(
    fg: &FactorGraph,
    params: &[f64],
    config: &BpConfig,
) -> Result<(Beliefs, BpDiagnostics), InferError> {
    BeliefPropagation::new(fg, Some(params), *config)?.run()
}

/// Geometric damping in log space; hard zeros always adopt the fresh
/// message so constraints propagate undamped.
fn damp(current: &Tensor, fresh: &Tensor, damping: f64) -> Tensor {
    let alg = fresh.algebra();
    let data = current
        .data()
        .iter()
        .zip(fresh.data().iter())
        .map(|(&old, &new)| {
            if alg.is_zero(old) || alg.is_zero(new) {
                new
            } else {
                alg.from_log_prob(
                    damping * alg.to_log_prob(old) + (1.0 - damping) * alg.to_log_prob(new),
                )
            }
        })
        .collect();
    Tensor::from_data(alg, fresh.dims().to_vec(), data)
}

/// Max absolute difference between two messages viewed as normalized
/// probability vectors.
fn prob_delta(old: &Tensor, new: &Tensor) -> f64 {
    let norm = |t: &Tensor| -> Vec<f64> {
        let mut c = t.clone();
        c.normalize();
        c.to_reals()
    };
    norm(old)
        .iter()
        .zip(norm(new).iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}

/// All messages of one flood sweep: every var→factor, then every
/// factor→var.
fn flood_order(fg: &FactorGraph) -> Vec<(EdgeId, MsgDir)> {
    let mut order = Vec::with_capacity(2 * fg.num_edges());
    for e in 0..fg.num_edges() {
        order.push((EdgeId(e), MsgDir::VarToFactor));
    }
    for e in 0..fg.num_edges() {
        order.push((EdgeId(e), MsgDir::FactorToVar));
    }
    order
}

/// Connected components over variables with edges. Returns per-var
/// component ids and the component count.
fn components(fg: &FactorGraph) -> (Vec<Option<usize>>, usize) {
    let mut comp: Vec<Option<usize>> = vec![None; fg.num_vars()];
    let mut count = 0;
    for start in fg.var_ids() {
        if comp[start.0].is_some() || fg.var_edges(start).is_empty() {
            continue;
        }
        let id = count;
        count += 1;
        let mut stack = vec![start];
        comp[start.0] = Some(id);
        while let Some(v) = stack.pop() {
            for &e in fg.var_edges(v) {
                let fid = fg.edge(e).factor;
                for &e2 in fg.factor_edges(fid) {
                    let u = fg.edge(e2).var;
                    if comp[u.0].is_none() {
                        comp[u.0] = Some(id);
                        stack.push(u);
                    }
                }
            }
        }
    }
    (comp, count)
}

/// Leaf→root and root→leaf message orders for an acyclic graph.
#[allow(clippy::type_complexity)]
fn tree_order(
    fg: &FactorGraph,
) -> Result<(Vec<(EdgeId, MsgDir)>, Vec<(EdgeId, MsgDir)>), InferError> {
    use std::collections::{HashMap, VecDeque};

    let mut visited: HashMap<Node, (usize, Option<EdgeId>)> = HashMap::new();
    let mut bfs_nodes: Vec<Node> = Vec::new();

    for start in fg.var_ids() {
        let start_node = Node::Var(start.0);
        if visited.contains_key(&start_node) || fg.var_edges(start).is_empty() {
            continue;
        }
        visited.insert(start_node, (0, None));
        let mut queue = VecDeque::from([start_node]);
        while let Some(node) = queue.pop_front() {
            bfs_nodes.push(node);
            let (depth, parent_edge) = visited[&node];
            let edges: Vec<EdgeId> = match node {
                Node::Var(v) => fg.var_edges(VarId(v)).to_vec(),
                Node::Factor(f) => fg.factor_edges(FactorId(f)).to_vec(),
            };
            for e in edges {
                if Some(e) == parent_edge {
                    continue;
                }
                let neighbor = match node {
                    Node::Var(_) => Node::Factor(fg.edge(e).factor.0),
                    Node::Factor(_) => Node::Var(fg.edge(e).var.0),
                };
                if visited.contains_key(&neighbor) {
                    return Err(InferError::CyclicTreeSchedule);
                }
                visited.insert(neighbor, (depth + 1, Some(e)));
                queue.push_back(neighbor);
            }
        }
    }

    // Upward: deepest nodes first, each sending along its parent edge.
    let mut by_depth = bfs_nodes.clone();
    by_depth.sort_by_key(|n| std::cmp::Reverse(visited[n].0));

    let msg_up = |node: &Node, edge: EdgeId| match node {
        Node::Var(_) => (edge, MsgDir::VarToFactor),
        Node::Factor(_) => (edge, MsgDir::FactorToVar),
    };
    let msg_down = |node: &Node, edge: EdgeId| match node {
        // The parent sends toward this node.
        Node::Var(_) => (edge, MsgDir::FactorToVar),
        Node::Factor(_) => (edge, MsgDir::VarToFactor),
    };

    let mut up = Vec::new();
    for node in &by_depth {
        if let Some(edge) = visited[node].1 {
            up.push(msg_up(node, edge));
        }
    }
    let mut down = Vec::new();
    for node in &bfs_nodes {
        if let Some(edge) = visited[node].1 {
            down.push(msg_down(node, edge));
        }
    }
    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::ExplicitFactor;
    use crate::var::{Var, VarKind};

    fn two_var_graph() -> FactorGraph {
        let mut fg = FactorGraph::new();
        let a = fg.add_var(Var::binary("a", VarKind::Predicted));
        let b = fg.add_var(Var::binary("b", VarKind::Predicted));
        let vs = fg.var_set(&[a, b]).unwrap();
        fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(
            vs,
            &[1.0, 2.0, 3.0, 4.0],
        )))
        .unwrap();
        fg
    }

    #[test]
    fn tree_bp_matches_hand_computation() {
        for alg in [Algebra::Real, Algebra::Log] {
            let fg = two_var_graph();
            let config = BpConfig {
                algebra: alg,
                ..BpConfig::default()
            };
            let beliefs = run_inference(&fg, &config).unwrap();
            // Z = 1+2+3+4 = 10; P(a=1) = (3+4)/10.
            assert!((beliefs.log_partition - 10.0f64.ln()).abs() < 1e-9);
            let pa = beliefs.var_marginal(VarId(0));
            assert!((pa[1] - 0.7).abs() < 1e-9);
            let pb = beliefs.var_marginal(VarId(1));
            assert!((pb[1] - 0.6).abs() < 1e-9);
        }
    }

    #[test]
    fn partition_readings_agree_across_nodes() {
        let fg = two_var_graph();
        let mut bp = BeliefPropagation::new(&fg, None, BpConfig::default()).unwrap();
        let _ = bp.run().unwrap();
        let z_a = bp.log_partition_at_var(VarId(0));
        let z_b = bp.log_partition_at_var(VarId(1));
        let z_f = bp.log_partition_at_factor(FactorId(0)).unwrap();
        assert!((z_a - z_b).abs() < 1e-9);
        assert!((z_a - z_f).abs() < 1e-9);
        assert!((z_a - 10.0f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn flood_on_tree_converges_to_exact() {
        let fg = two_var_graph();
        let config = BpConfig {
            schedule: BpSchedule::Flood,
            update_order: UpdateOrder::Parallel,
            max_iterations: 10,
            convergence_tolerance: Some(1e-9),
            ..BpConfig::default()
        };
        let beliefs = run_inference(&fg, &config).unwrap();
        assert!((beliefs.var_marginal(VarId(0))[1] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn cyclic_graph_rejects_tree_schedule() {
        let mut fg = FactorGraph::new();
        let a = fg.add_var(Var::binary("a", VarKind::Predicted));
        let b = fg.add_var(Var::binary("b", VarKind::Predicted));
        for _ in 0..2 {
            let vs = fg.var_set(&[a, b]).unwrap();
            fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(
                vs,
                &[1.0, 1.0, 1.0, 2.0],
            )))
            .unwrap();
        }
        let err = run_inference(&fg, &BpConfig::default());
        assert!(matches!(err, Err(InferError::CyclicTreeSchedule)));

        // The flood schedule handles it.
        let config = BpConfig {
            schedule: BpSchedule::Flood,
            max_iterations: 30,
            damping: 0.3,
            ..BpConfig::default()
        };
        let beliefs = run_inference(&fg, &config).unwrap();
        let pa = beliefs.var_marginal(VarId(0));
        assert!(pa[1] > 0.5);
    }

    #[test]
    fn clamped_graph_reads_sliced_partition() {
        let fg = two_var_graph();
        let mut cfg = crate::varset::VarConfig::new();
        cfg.set(VarId(1), 1);
        let clamped = fg.clamped(&cfg).unwrap();
        let beliefs = run_inference(&clamped, &BpConfig::default()).unwrap();
        // Z over a with b=1: 2 + 4 = 6.
        assert!((beliefs.log_partition - 6.0f64.ln()).abs() < 1e-9);
        // Clamped variable reads as a point mass.
        assert_eq!(beliefs.var_marginal(VarId(1)), vec![0.0, 1.0]);
    }
}
