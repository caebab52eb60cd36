//! Belief propagation against enumeration on acyclic graphs with mixed
//! arities, plus the partition-agreement and normalization invariants.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use marginalia_core::Algebra;
use marginalia_infer::bp::{
    run_inference, BeliefPropagation, BpConfig, BpSchedule, UpdateOrder,
};
use marginalia_infer::exact::enumerate_joint;
use marginalia_infer::factor::{ExplicitFactor, Factor};
use marginalia_infer::graph::{FactorGraph, FactorId};
use marginalia_infer::var::{Var, VarId, VarKind};

/// A small random tree: x0 is the hub, with a chain hanging off x1.
///
/// ```text
/// x0 —[f01]— x1 —[f13]— x3
///  |
/// [f02]— x2    plus unary factors on x0 and x3
/// ```
fn random_tree(seed: u64) -> (FactorGraph, Vec<VarId>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let arities = [2usize, 3, 2, 3];
    let mut fg = FactorGraph::new();
    let vars: Vec<VarId> = arities
        .iter()
        .enumerate()
        .map(|(i, &a)| {
            let states = (0..a).map(|s| format!("s{s}")).collect();
            fg.add_var(Var::new(format!("x{i}"), states, VarKind::Predicted))
        })
        .collect();

    let mut pairwise = |a: usize, b: usize, fg: &mut FactorGraph, rng: &mut StdRng| {
        let vs = fg.var_set(&[vars[a], vars[b]]).unwrap();
        let table: Vec<f64> = (0..vs.num_configs())
            .map(|_| rng.gen_range(0.2..2.0))
            .collect();
        fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(vs, &table)))
            .unwrap();
    };
    pairwise(0, 1, &mut fg, &mut rng);
    pairwise(0, 2, &mut fg, &mut rng);
    pairwise(1, 3, &mut fg, &mut rng);
    for &v in [vars[0], vars[3]].iter() {
        let vs = fg.var_set(&[v]).unwrap();
        let table: Vec<f64> = (0..vs.num_configs())
            .map(|_| rng.gen_range(0.2..2.0))
            .collect();
        fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(vs, &table)))
            .unwrap();
    }
    (fg, vars)
}

#[test]
fn tree_schedule_is_exact_in_all_algebras() {
    for algebra in [Algebra::Real, Algebra::Log, Algebra::SignedLog] {
        let (fg, vars) = random_tree(21);
        let config = BpConfig {
            algebra,
            ..BpConfig::default()
        };
        let beliefs = run_inference(&fg, &config).unwrap();
        let joint = enumerate_joint(&fg, None).unwrap();

        assert!(
            (beliefs.log_partition - joint.log_partition()).abs() < 1e-8,
            "{algebra:?}"
        );
        for &v in &vars {
            let exact = joint.marginal(v);
            let got = beliefs.var_marginal(v);
            for (e, g) in exact.iter().zip(got.iter()) {
                assert!((e - g).abs() < 1e-8, "{algebra:?} {v}");
            }
            assert!((got.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }
}

#[test]
fn partition_readings_agree_at_every_node() {
    let (fg, vars) = random_tree(33);
    let mut bp = BeliefPropagation::new(&fg, None, BpConfig::default()).unwrap();
    let (beliefs, diagnostics) = bp.run().unwrap();
    assert!(diagnostics.converged);

    let reference = beliefs.log_partition;
    for &v in &vars {
        assert!((bp.log_partition_at_var(v) - reference).abs() < 1e-9, "{v}");
    }
    for f in 0..fg.num_factors() {
        let z = bp.log_partition_at_factor(FactorId(f)).unwrap();
        assert!((z - reference).abs() < 1e-9, "factor {f}");
    }
}

#[test]
fn flood_matches_tree_schedule_on_acyclic_graphs() {
    let (fg, vars) = random_tree(55);
    let exact = run_inference(&fg, &BpConfig::default()).unwrap();

    for update_order in [UpdateOrder::Sequential, UpdateOrder::Parallel] {
        let config = BpConfig {
            schedule: BpSchedule::Flood,
            update_order,
            max_iterations: 30,
            convergence_tolerance: Some(1e-12),
            ..BpConfig::default()
        };
        let flooded = run_inference(&fg, &config).unwrap();
        assert!((flooded.log_partition - exact.log_partition).abs() < 1e-7);
        for &v in &vars {
            let a = exact.var_marginal(v);
            let b = flooded.var_marginal(v);
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-7, "{update_order:?} {v}");
            }
        }
    }
}

#[test]
fn disconnected_components_multiply_partitions() {
    // Two independent two-var components in one graph.
    let mut fg = FactorGraph::new();
    let mut make_pair = |tag: &str, table: &[f64], fg: &mut FactorGraph| {
        let a = fg.add_var(Var::binary(format!("{tag}a"), VarKind::Predicted));
        let b = fg.add_var(Var::binary(format!("{tag}b"), VarKind::Predicted));
        let vs = fg.var_set(&[a, b]).unwrap();
        fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(vs, table)))
            .unwrap();
        a
    };
    let a1 = make_pair("p", &[1.0, 2.0, 3.0, 4.0], &mut fg);
    let _ = make_pair("q", &[2.0, 2.0, 1.0, 5.0], &mut fg);

    let mut bp = BeliefPropagation::new(&fg, None, BpConfig::default()).unwrap();
    let (beliefs, _) = bp.run().unwrap();
    let expected = 10.0f64.ln() + 10.0f64.ln();
    assert!((beliefs.log_partition - expected).abs() < 1e-9);
    // A single node still reads the whole graph's partition.
    assert!((bp.log_partition_at_var(a1) - expected).abs() < 1e-9);
}
