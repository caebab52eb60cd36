//! # Module graphs
//!
//! A [`ModuleGraph`] is a DAG of differentiable modules. Each node holds an
//! [`Op`], its cached output value, and its accumulated output adjoint.
//! Edges carry the input slot they feed.
//!
//! - [`ModuleGraph::forward`] runs nodes in topological order and caches
//!   every output.
//! - [`ModuleGraph::backward`] runs the exact reverse order; every op's VJP
//!   **adds into** its inputs' adjoints, because a module may feed several
//!   consumers.
//!
//! Nodes are addressed by `petgraph` integer handles with explicit
//! adjacency, so shared sub-results are plain fan-out edges rather than
//! shared references.
//!
//! ## Example
//!
//! ```rust
//! use marginalia_core::{Algebra, Tensor};
//! use marginalia_diff::graph::ModuleGraph;
//!
//! // loss = sum(a ⊗ b)
//! let mut g = ModuleGraph::new();
//! let a = g.input();
//! let b = g.input();
//! let prod = g.times(a, b);
//! let loss = g.sum(prod);
//! g.mark_output(loss);
//!
//! let alg = Algebra::Real;
//! g.forward(&[
//!     Tensor::from_reals(alg, &[1.0, 2.0]),
//!     Tensor::from_reals(alg, &[3.0, 4.0]),
//! ]);
//! g.backward();
//! let da = g.input_adjoint(0).unwrap();
//! assert_eq!(da.to_reals(), vec![3.0, 4.0]);
//! ```

use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use marginalia_core::Tensor;

use crate::ops::{ExternOp, Op};

/// One node of the module DAG: an operation, its cached output, and its
/// accumulated output adjoint.
#[derive(Debug)]
pub struct ModuleNode {
    pub op: Op,
    pub value: Option<Tensor>,
    pub adjoint: Option<Tensor>,
}

/// A DAG of differentiable modules over semiring tensors.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    graph: DiGraph<ModuleNode, usize>,
    inputs: Vec<NodeIndex>,
    output: Option<NodeIndex>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node wired to the given input nodes (slot order = argument
    /// order).
    pub fn add_op(&mut self, op: Op, inputs: &[NodeIndex]) -> NodeIndex {
        if let Some(arity) = op.arity() {
            assert_eq!(inputs.len(), arity, "{op:?} expects {arity} inputs");
        }
        let idx = self.graph.add_node(ModuleNode {
            op,
            value: None,
            adjoint: None,
        });
        for (slot, &src) in inputs.iter().enumerate() {
            self.graph.add_edge(src, idx, slot);
        }
        idx
    }

    /// Add an external-input placeholder; returns its node. Inputs are
    /// bound positionally by [`ModuleGraph::forward`].
    pub fn input(&mut self) -> NodeIndex {
        let index = self.inputs.len();
        let idx = self.add_op(Op::Input { index }, &[]);
        self.inputs.push(idx);
        idx
    }

    /// Add a constant node.
    pub fn constant(&mut self, value: Tensor) -> NodeIndex {
        self.add_op(Op::Const(value), &[])
    }

    pub fn plus(&mut self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        self.add_op(Op::Plus, &[a, b])
    }

    pub fn minus(&mut self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        self.add_op(Op::Minus, &[a, b])
    }

    pub fn times(&mut self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        self.add_op(Op::Times, &[a, b])
    }

    pub fn divide(&mut self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        self.add_op(Op::Divide, &[a, b])
    }

    /// Keep-left-if-zero division; see [`Op::GuardedDivide`].
    pub fn guarded_divide(&mut self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        self.add_op(Op::GuardedDivide, &[a, b])
    }

    /// Subtraction clamped at the additive identity; see
    /// [`Op::ClampedMinus`].
    pub fn clamped_minus(&mut self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        self.add_op(Op::ClampedMinus, &[a, b])
    }

    pub fn sum(&mut self, x: NodeIndex) -> NodeIndex {
        self.add_op(Op::Sum, &[x])
    }

    pub fn product(&mut self, x: NodeIndex) -> NodeIndex {
        self.add_op(Op::Product, &[x])
    }

    pub fn select(&mut self, x: NodeIndex, index: usize) -> NodeIndex {
        self.add_op(Op::Select { index }, &[x])
    }

    pub fn slice(&mut self, x: NodeIndex, start: usize, len: usize) -> NodeIndex {
        self.add_op(Op::Slice { start, len }, &[x])
    }

    /// Add an externally implemented operation.
    pub fn extern_op(&mut self, op: Arc<dyn ExternOp>, inputs: &[NodeIndex]) -> NodeIndex {
        self.add_op(Op::Extern(op), inputs)
    }

    /// Designate the graph's output node.
    pub fn mark_output(&mut self, node: NodeIndex) {
        self.output = Some(node);
    }

    pub fn output_node(&self) -> NodeIndex {
        self.output.expect("no output marked")
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Topological order via Kahn's algorithm.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.edges_directed(n, Direction::Incoming).count())
            .collect();
        let mut queue: std::collections::VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| in_degree[n.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                // Parallel edges decrement once each.
                in_degree[succ.index()] -= 1;
                if in_degree[succ.index()] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        assert_eq!(order.len(), self.graph.node_count(), "module graph has a cycle");
        order
    }

    fn gather_inputs(&self, node: NodeIndex) -> Vec<Tensor> {
        let count = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .count();
        let mut inputs: Vec<Option<Tensor>> = vec![None; count];
        for edge in self.graph.edges_directed(node, Direction::Incoming) {
            let slot = *edge.weight();
            let value = self.graph[edge.source()]
                .value
                .clone()
                .expect("input value not yet computed");
            inputs[slot] = Some(value);
        }
        inputs.into_iter().map(|t| t.expect("missing input slot")).collect()
    }

    /// Run the forward pass with the given external inputs bound
    /// positionally; returns the output value.
    pub fn forward(&mut self, bound: &[Tensor]) -> &Tensor {
        assert_eq!(bound.len(), self.inputs.len(), "wrong number of inputs");
        for node in self.topological_order() {
            let value = match &self.graph[node].op {
                Op::Input { index } => bound[*index].clone(),
                op => {
                    let inputs = self.gather_inputs(node);
                    let refs: Vec<&Tensor> = inputs.iter().collect();
                    op.forward(&refs)
                }
            };
            self.graph[node].value = Some(value);
        }
        self.output_value()
    }

    /// Run the backward pass seeded with the multiplicative identity of
    /// the output's gradient algebra (d out / d out = 1).
    pub fn backward(&mut self) {
        let out_alg = self
            .output_value()
            .algebra()
            .grad_algebra();
        let seed = Tensor::scalar(out_alg, out_alg.one());
        self.backward_with_seed(seed);
    }

    /// Run the backward pass from an explicit output adjoint. Adjoints
    /// accumulate — a node feeding several consumers receives the semiring
    /// sum of their contributions.
    pub fn backward_with_seed(&mut self, seed: Tensor) {
        for node in self.graph.node_indices() {
            self.graph[node].adjoint = None;
        }
        let output = self.output_node();
        self.graph[output].adjoint = Some(seed);

        let order = self.topological_order();
        for &node in order.iter().rev() {
            let Some(adjoint) = self.graph[node].adjoint.clone() else {
                continue;
            };
            let inputs = self.gather_inputs(node);
            let refs: Vec<&Tensor> = inputs.iter().collect();
            let value = self.graph[node].value.clone().expect("forward not run");
            let grads = self.graph[node].op.vjp(&refs, &value, &adjoint);
            if grads.is_empty() {
                continue;
            }

            let edges: Vec<(NodeIndex, usize)> = self
                .graph
                .edges_directed(node, Direction::Incoming)
                .map(|e| (e.source(), *e.weight()))
                .collect();
            for (source, slot) in edges {
                let grad = &grads[slot];
                let ga = grad.algebra();
                let entry = &mut self.graph[source].adjoint;
                match entry {
                    Some(existing) => *existing = existing.plus(grad),
                    None => {
                        *entry = Some(Tensor::zeros(ga, grad.dims().to_vec()).plus(grad));
                    }
                }
            }
        }
    }

    /// Cached output of the designated output node.
    pub fn output_value(&self) -> &Tensor {
        self.graph[self.output_node()]
            .value
            .as_ref()
            .expect("forward not run")
    }

    /// Cached value of any node.
    pub fn value(&self, node: NodeIndex) -> &Tensor {
        self.graph[node].value.as_ref().expect("forward not run")
    }

    /// Accumulated adjoint of any node (None if no gradient reached it).
    pub fn adjoint(&self, node: NodeIndex) -> Option<&Tensor> {
        self.graph[node].adjoint.as_ref()
    }

    /// Accumulated adjoint of the i-th external input.
    pub fn input_adjoint(&self, index: usize) -> Option<&Tensor> {
        self.adjoint(self.inputs[index])
    }

    pub fn input_node(&self, index: usize) -> NodeIndex {
        self.inputs[index]
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::Algebra;

    #[test]
    fn forward_diamond_fan_out() {
        // out = sum((x ⊗ x) ⊕ x): x feeds three consumers.
        let mut g = ModuleGraph::new();
        let x = g.input();
        let sq = g.times(x, x);
        let both = g.plus(sq, x);
        let out = g.sum(both);
        g.mark_output(out);

        let alg = Algebra::Real;
        let value = g.forward(&[Tensor::from_reals(alg, &[2.0, 3.0])]);
        // (4 + 2) + (9 + 3) = 18
        assert_eq!(value.as_scalar(), 18.0);
    }

    #[test]
    fn backward_accumulates_over_consumers() {
        // d/dx sum(x⊗x ⊕ x) = 2x + 1
        let mut g = ModuleGraph::new();
        let x = g.input();
        let sq = g.times(x, x);
        let both = g.plus(sq, x);
        let out = g.sum(both);
        g.mark_output(out);

        g.forward(&[Tensor::from_reals(Algebra::Real, &[2.0, 3.0])]);
        g.backward();
        let dx = g.input_adjoint(0).unwrap().to_reals();
        assert_eq!(dx, vec![5.0, 7.0]);
    }

    #[test]
    fn backward_in_log_algebra_produces_signed_adjoints() {
        // out = sum(a ⊘ b); d out / d b is negative.
        let mut g = ModuleGraph::new();
        let a = g.input();
        let b = g.input();
        let ratio = g.divide(a, b);
        let out = g.sum(ratio);
        g.mark_output(out);

        let alg = Algebra::Log;
        g.forward(&[
            Tensor::from_reals(alg, &[0.3]),
            Tensor::from_reals(alg, &[0.6]),
        ]);
        g.backward();
        let ga = alg.grad_algebra();
        let db = g.input_adjoint(1).unwrap();
        // d(a/b)/db = -a/b^2 = -0.3/0.36
        assert!((ga.to_real(db.get_flat(0)) + 0.3 / 0.36).abs() < 1e-9);
    }

    #[test]
    fn unreached_nodes_have_no_adjoint() {
        let mut g = ModuleGraph::new();
        let x = g.input();
        let y = g.input();
        let out = g.sum(x);
        g.mark_output(out);
        let alg = Algebra::Real;
        g.forward(&[
            Tensor::from_reals(alg, &[1.0]),
            Tensor::from_reals(alg, &[1.0]),
        ]);
        g.backward();
        assert!(g.input_adjoint(0).is_some());
        assert!(g.input_adjoint(1).is_none());
        let _ = y;
    }
}
