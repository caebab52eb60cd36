//! Exactness of the constituency-bracketing factor against brute-force
//! enumeration over all span assignments.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use marginalia_core::Algebra;
use marginalia_infer::bp::{run_inference, BpConfig};
use marginalia_infer::exact::enumerate_joint;
use marginalia_infer::factor::{ExplicitFactor, Factor, GlobalFactor};
use marginalia_infer::global::ConsTreeFactor;
use marginalia_infer::graph::{FactorGraph, FactorId};
use marginalia_infer::var::{VarId, FALSE, TRUE};
use marginalia_infer::varset::VarConfig;

fn cons_graph(n: usize, seed: u64) -> (FactorGraph, FactorId, Vec<VarId>) {
    let mut fg = FactorGraph::new();
    let (fid, _, _) = ConsTreeFactor::attach(&mut fg, n).unwrap();
    let span_vars: Vec<VarId> = fg.var_ids().collect();

    let mut rng = StdRng::seed_from_u64(seed);
    for &v in &span_vars {
        let vs = fg.var_set(&[v]).unwrap();
        let p_false = rng.gen_range(0.5..1.5);
        let p_true = rng.gen_range(0.5..1.5);
        fg.add_factor(Factor::Explicit(ExplicitFactor::from_reals(
            vs,
            &[p_false, p_true],
        )))
        .unwrap();
    }
    (fg, fid, span_vars)
}

#[test]
fn marginals_match_enumeration() {
    for n in [1usize, 2, 3] {
        for algebra in [Algebra::Real, Algebra::Log] {
            let (fg, _, span_vars) = cons_graph(n, 13 + n as u64);
            let config = BpConfig {
                algebra,
                ..BpConfig::default()
            };
            let beliefs = run_inference(&fg, &config).unwrap();
            let joint = enumerate_joint(&fg, None).unwrap();

            assert!(
                (beliefs.log_partition - joint.log_partition()).abs() < 1e-8,
                "n={n} {algebra:?}"
            );
            for &v in &span_vars {
                let exact = joint.marginal(v);
                let got = beliefs.var_marginal(v);
                assert!(
                    (got[TRUE] - exact[TRUE]).abs() < 1e-8,
                    "n={n} {algebra:?} {v}"
                );
                assert!((got.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            }
        }
    }
}

/// Reference validity: exactly the span set of one full binary tree.
fn reference_valid(n: usize, on: &std::collections::HashSet<(usize, usize)>) -> bool {
    fn covers(
        i: usize,
        j: usize,
        on: &std::collections::HashSet<(usize, usize)>,
        used: &mut Vec<(usize, usize)>,
    ) -> bool {
        if !on.contains(&(i, j)) {
            return false;
        }
        used.push((i, j));
        if j == i + 1 {
            return true;
        }
        for k in (i + 1)..j {
            if on.contains(&(i, k)) && on.contains(&(k, j)) {
                let mark = used.len();
                if covers(i, k, on, used) && covers(k, j, on, used) {
                    return true;
                }
                used.truncate(mark);
            }
        }
        false
    }
    let mut used = Vec::new();
    covers(0, n, on, &mut used) && used.len() == on.len()
}

#[test]
fn score_is_identity_exactly_on_valid_bracketings() {
    for n in [1usize, 2, 3] {
        let mut fg = FactorGraph::new();
        let (fid, spans, _) = ConsTreeFactor::attach(&mut fg, n).unwrap();
        let Factor::Global(global) = fg.factor(fid) else {
            panic!()
        };
        let ids = global.vars().ids().to_vec();

        let mut valid_count = 0usize;
        for mask in 0..(1usize << ids.len()) {
            let mut config = VarConfig::new();
            let mut on = std::collections::HashSet::new();
            for (bit, &id) in ids.iter().enumerate() {
                let state = if mask & (1 << bit) != 0 { TRUE } else { FALSE };
                config.set(id, state);
            }
            for i in 0..n {
                for j in (i + 1)..=n {
                    if config.get(spans.span(i, j)) == Some(TRUE) {
                        on.insert((i, j));
                    }
                }
            }
            let score = global.log_unnormalized_score(&config);
            if reference_valid(n, &on) {
                valid_count += 1;
                assert_eq!(score, 0.0, "n={n} mask={mask:b}");
            } else {
                assert_eq!(score, f64::NEG_INFINITY, "n={n} mask={mask:b}");
            }
        }
        // Catalan(n-1) valid bracketings.
        let catalan = [1usize, 1, 2][n - 1];
        assert_eq!(valid_count, catalan);
    }
}

#[test]
fn span_marginals_count_containing_bracketings() {
    let mut fg = FactorGraph::new();
    let (_, spans, factor) = ConsTreeFactor::attach(&mut fg, 3).unwrap();
    let weights = marginalia_core::Tensor::ones(Algebra::Real, vec![fg.num_vars()]);
    let (sums, log_z) = factor.span_marginals(&weights);
    assert!((log_z - 2.0f64.ln()).abs() < 1e-9);
    let ids = fg.var_ids().collect::<Vec<_>>();
    let pos = |v| ids.iter().position(|&x| x == v).unwrap();
    // Leaves and root sit in both bracketings; internal spans in one.
    assert!((sums[pos(spans.span(0, 3))] - 2.0).abs() < 1e-9);
    assert!((sums[pos(spans.span(0, 2))] - 1.0).abs() < 1e-9);
    assert!((sums[pos(spans.span(1, 3))] - 1.0).abs() < 1e-9);
}

#[test]
fn uniform_messages_report_bracketing_count() {
    // n = 4, uniform odds: the structure partition is Catalan(3) = 5.
    let mut fg = FactorGraph::new();
    let (fid, _, _) = ConsTreeFactor::attach(&mut fg, 4).unwrap();
    let Factor::Global(global) = fg.factor(fid) else {
        panic!()
    };
    let e = global.vars().len();
    let ones: Vec<_> = (0..e)
        .map(|_| marginalia_core::Tensor::from_reals(Algebra::Log, &[1.0, 1.0]))
        .collect();
    let out = global.compute_messages(&ones).unwrap();
    assert!((out.log_partition - 5.0f64.ln()).abs() < 1e-9);
}
