//! Finite-difference checks of the structured factors' internal module
//! graphs: central differences (step 1e-8) against the hand-written
//! reverse sweeps, in the real and log (signed-log adjoint) algebras.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use marginalia_core::{Algebra, Tensor};
use marginalia_diff::gradcheck::grad_check;
use marginalia_infer::global::{ConsTreeFactor, ProjDepTreeFactor};
use marginalia_infer::graph::FactorGraph;

fn random_messages(alg: Algebra, len: usize, seed: u64) -> (Tensor, Tensor) {
    let mut rng = StdRng::seed_from_u64(seed);
    let falses: Vec<f64> = (0..len).map(|_| rng.gen_range(0.4..1.3)).collect();
    let trues: Vec<f64> = (0..len).map(|_| rng.gen_range(0.4..1.3)).collect();
    (
        Tensor::from_reals(alg, &falses),
        Tensor::from_reals(alg, &trues),
    )
}

#[test]
fn dep_tree_partition_gradients_check_out() {
    for n in [2usize, 3] {
        for single_root in [true, false] {
            for alg in [Algebra::Real, Algebra::Log] {
                let mut fg = FactorGraph::new();
                let (_, _, factor) =
                    ProjDepTreeFactor::attach(&mut fg, n, single_root).unwrap();
                let num_links = fg.num_vars();

                let mut pipeline = factor.message_pipeline();
                let (f, t) = random_messages(alg, num_links, 100 + n as u64);
                grad_check(&mut pipeline.graph, &[f, t], 1e-8, 1e-5).unwrap_or_else(
                    |e| panic!("n={n} single_root={single_root} {alg:?}: {e}"),
                );
            }
        }
    }
}

#[test]
fn dep_tree_belief_gradients_check_out() {
    // Differentiate single TRUE- and FALSE-belief entries, exercising the
    // clamped subtract and the guarded divisions on the backward path.
    let mut fg = FactorGraph::new();
    let (_, _, factor) = ProjDepTreeFactor::attach(&mut fg, 3, true).unwrap();
    let num_links = fg.num_vars();

    for alg in [Algebra::Real, Algebra::Log] {
        for entry in [0usize, num_links / 2] {
            let mut pipeline = factor.message_pipeline();
            let picked = pipeline.graph.select(pipeline.belief_true, entry);
            pipeline.graph.mark_output(picked);
            let (f, t) = random_messages(alg, num_links, 7 + entry as u64);
            grad_check(&mut pipeline.graph, &[f, t], 1e-8, 1e-5)
                .unwrap_or_else(|e| panic!("belief_true {alg:?} {entry}: {e}"));

            let mut pipeline = factor.message_pipeline();
            let picked = pipeline.graph.select(pipeline.belief_false, entry);
            pipeline.graph.mark_output(picked);
            let (f, t) = random_messages(alg, num_links, 19 + entry as u64);
            grad_check(&mut pipeline.graph, &[f, t], 1e-8, 1e-5)
                .unwrap_or_else(|e| panic!("belief_false {alg:?} {entry}: {e}"));
        }
    }
}

#[test]
fn cons_tree_gradients_check_out() {
    for n in [2usize, 3, 4] {
        for alg in [Algebra::Real, Algebra::Log] {
            let mut fg = FactorGraph::new();
            let (_, _, factor) = ConsTreeFactor::attach(&mut fg, n).unwrap();
            let num_spans = fg.num_vars();

            let mut pipeline = factor.message_pipeline();
            let (f, t) = random_messages(alg, num_spans, 200 + n as u64);
            grad_check(&mut pipeline.graph, &[f, t], 1e-8, 1e-5)
                .unwrap_or_else(|e| panic!("n={n} {alg:?}: {e}"));
        }
    }
}

#[test]
fn hard_zero_edges_get_zero_gradient() {
    // An edge whose TRUE message is the additive identity is structurally
    // forbidden: its odds ratio stays zero and no gradient reaches it.
    let alg = Algebra::Log;
    let mut fg = FactorGraph::new();
    let (_, _, factor) = ProjDepTreeFactor::attach(&mut fg, 2, false).unwrap();
    let num_links = fg.num_vars();

    let mut pipeline = factor.message_pipeline();
    let falses = Tensor::from_reals(alg, &vec![1.0; num_links]);
    let mut trues_raw = vec![1.0; num_links];
    trues_raw[2] = 0.0; // forbid the 0→1 link
    let trues = Tensor::from_reals(alg, &trues_raw);

    pipeline.graph.forward(&[falses, trues]);
    pipeline.graph.backward();
    let ga = alg.grad_algebra();
    let dt = pipeline.graph.input_adjoint(1).unwrap();
    assert!(
        ga.is_zero(dt.get_flat(2)),
        "forbidden edge must get zero gradient"
    );
    assert!(!dt.get_flat(2).is_nan());
    // Live edges still receive gradient.
    assert!(!ga.is_zero(dt.get_flat(0)));
}
