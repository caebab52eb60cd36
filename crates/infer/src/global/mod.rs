//! # Global factors
//!
//! A global factor scores an exponentially large set of joint boolean
//! assignments (all projective dependency trees, all binary bracketings)
//! without ever tabulating it: exact marginals come from an embedded
//! polynomial-time inside-outside dynamic program.
//!
//! Message computation is shared across the structured instances and
//! follows one pipeline, expressed as a [`ModuleGraph`] so the autodiff
//! engine backpropagates through it uniformly:
//!
//! 1. per edge, the odds ratio `msg(TRUE) ⊘ msg(FALSE)` (keep-left-if-zero,
//!    so structurally forbidden edges stay at zero with zero gradient);
//! 2. `π = Π msg(FALSE)` over all incident edges;
//! 3. the inside-outside [`ExternOp`] maps odds ratios to per-edge sums
//!    over all structures containing that edge, plus the structure
//!    partition;
//! 4. `belief(TRUE) = π ⊗ edge sums`, `partition = π ⊗ structure
//!    partition`;
//! 5. `belief(FALSE) = partition ⊖ belief(TRUE)` via the clamped subtract
//!    (log-subtract underflow clamps to zero and is counted, never NaN);
//! 6. outgoing message = belief ⊘ incoming message, again guarded so a
//!    hard zero propagates unchanged.

pub mod cons_tree;
pub mod dep_tree;

use std::sync::Arc;

use marginalia_core::Tensor;
use marginalia_diff::graph::ModuleGraph;
use marginalia_diff::ops::ExternOp;
use petgraph::graph::NodeIndex;

use crate::error::InferError;
use crate::factor::{GlobalOutput, StructuredDiagnostics};
use crate::var::{FALSE, TRUE};

pub use cons_tree::{ConsTreeFactor, SpanVars};
pub use dep_tree::{DepLinks, ProjDepTreeFactor};

/// The shared message pipeline of a structured factor, with handles to
/// its interesting intermediate nodes. Inputs, in order: the FALSE-state
/// messages and the TRUE-state messages, each a vector over incident
/// edges. The marked output is the factor partition.
#[derive(Debug)]
pub struct MessagePipeline {
    pub graph: ModuleGraph,
    pub in_false: NodeIndex,
    pub in_true: NodeIndex,
    pub odds: NodeIndex,
    pub edge_sums: NodeIndex,
    pub belief_true: NodeIndex,
    pub belief_false: NodeIndex,
    pub partition: NodeIndex,
    pub msg_true: NodeIndex,
    pub msg_false: NodeIndex,
}

/// Assemble the pipeline around an inside-outside operation whose output
/// is `num_edges` per-edge sums followed by the structure partition.
pub fn build_pipeline(dp: Arc<dyn ExternOp>, num_edges: usize) -> MessagePipeline {
    let mut g = ModuleGraph::new();
    let in_false = g.input();
    let in_true = g.input();
    let odds = g.guarded_divide(in_true, in_false);
    let pi = g.product(in_false);
    let dp_out = g.extern_op(dp, &[odds]);
    let edge_sums = g.slice(dp_out, 0, num_edges);
    let z_struct = g.select(dp_out, num_edges);
    let belief_true = g.times(edge_sums, pi);
    let partition = g.times(z_struct, pi);
    let belief_false = g.clamped_minus(partition, belief_true);
    let msg_true = g.guarded_divide(belief_true, in_true);
    let msg_false = g.guarded_divide(belief_false, in_false);
    g.mark_output(partition);
    MessagePipeline {
        graph: g,
        in_false,
        in_true,
        odds,
        edge_sums,
        belief_true,
        belief_false,
        partition,
        msg_true,
        msg_false,
    }
}

/// Run the shared pipeline over incoming binary messages and package the
/// outgoing messages, partition, and diagnostics.
pub(crate) fn structured_messages(
    dp: Arc<dyn ExternOp>,
    incoming: &[Tensor],
) -> Result<GlobalOutput, InferError> {
    let num_edges = incoming.len();
    assert!(num_edges > 0, "structured factor with no edges");
    let alg = incoming[0].algebra();

    let mut falses = Vec::with_capacity(num_edges);
    let mut trues = Vec::with_capacity(num_edges);
    for (e, msg) in incoming.iter().enumerate() {
        debug_assert_eq!(msg.len(), 2, "structured factors take binary variables");
        let f = msg.get_flat(FALSE);
        if alg.is_zero(f) {
            return Err(InferError::StructuredHardEvidence { edge: e });
        }
        falses.push(f);
        trues.push(msg.get_flat(TRUE));
    }

    let mut pipeline = build_pipeline(dp, num_edges);
    pipeline.graph.forward(&[
        Tensor::vector(alg, falses),
        Tensor::vector(alg, trues),
    ]);

    let mut diagnostics = StructuredDiagnostics::default();
    for &odds in pipeline.graph.value(pipeline.odds).data() {
        if !alg.is_zero(odds) {
            diagnostics.observe_log_odds(alg.to_log_prob(odds));
        }
    }

    let log_partition = alg.to_log_prob(pipeline.graph.value(pipeline.partition).as_scalar());
    let belief_true = pipeline.graph.value(pipeline.belief_true);
    for &bt in belief_true.data() {
        if alg.to_log_prob(bt) > log_partition {
            diagnostics.clamped_beliefs += 1;
        }
    }

    let msg_true = pipeline.graph.value(pipeline.msg_true);
    let msg_false = pipeline.graph.value(pipeline.msg_false);
    let messages = (0..num_edges)
        .map(|e| {
            Tensor::vector(alg, vec![msg_false.get_flat(e), msg_true.get_flat(e)])
        })
        .collect();

    Ok(GlobalOutput {
        messages,
        log_partition,
        diagnostics,
    })
}
