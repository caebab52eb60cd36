//! End-to-end CRF objective checks: chain CRFs with latent variables and
//! a dependency-tree CRF, with analytic gradients verified by central
//! differences on the objective itself.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use marginalia_infer::bp::BpConfig;
use marginalia_infer::factor::{ExpFamilyFactor, Factor, FeatureVec};
use marginalia_infer::global::ProjDepTreeFactor;
use marginalia_infer::graph::FactorGraph;
use marginalia_infer::var::{Var, VarId, VarKind, FALSE, TRUE};
use marginalia_infer::varset::VarConfig;
use marginalia_train::model::FgModel;
use marginalia_train::objective::{get_objective, LL_TOLERANCE};

/// A 3-variable chain CRF with per-state emission features and shared
/// transition features. `latent_middle` leaves x1 unobserved at training
/// time.
fn chain_example(
    model: &mut FgModel,
    latent_middle: bool,
) -> (FactorGraph, VarConfig, Vec<VarId>) {
    let mut fg = FactorGraph::new();
    let vars: Vec<VarId> = (0..3)
        .map(|i| {
            let kind = if latent_middle && i == 1 {
                VarKind::Latent
            } else {
                VarKind::Predicted
            };
            fg.add_var(Var::binary(format!("x{i}"), kind))
        })
        .collect();

    for (i, &v) in vars.iter().enumerate() {
        let vs = fg.var_set(&[v]).unwrap();
        let features = (0..2)
            .map(|s| {
                let ix = model.feature(&format!("emit:{i}:{s}")).unwrap();
                [(ix, 1.0)].into_iter().collect::<FeatureVec>()
            })
            .collect();
        fg.add_factor(Factor::ExpFamily(ExpFamilyFactor::new(vs, features)))
            .unwrap();
    }
    for w in 0..2 {
        let vs = fg.var_set(&[vars[w], vars[w + 1]]).unwrap();
        let features = (0..4)
            .map(|c| {
                let (a, b) = (c / 2, c % 2);
                let ix = model.feature(&format!("trans:{a}{b}")).unwrap();
                [(ix, 1.0)].into_iter().collect::<FeatureVec>()
            })
            .collect();
        fg.add_factor(Factor::ExpFamily(ExpFamilyFactor::new(vs, features)))
            .unwrap();
    }

    let mut gold = VarConfig::new();
    gold.set(vars[0], 1).set(vars[2], 0);
    if !latent_middle {
        gold.set(vars[1], 1);
    }
    (fg, gold, vars)
}

fn randomize(model: &mut FgModel, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for p in model.params_mut() {
        *p = rng.gen_range(-0.8..0.8);
    }
}

/// Central-difference check of the objective gradient.
fn check_objective_gradient(fg: &FactorGraph, gold: &VarConfig, model: &mut FgModel) {
    let bp = BpConfig::default();
    let mut grad = model.zero_gradient();
    get_objective(fg, gold, 1.0, 0, 1, bp)
        .value_and_gradient(model, Some(&mut grad))
        .unwrap();

    let h = 1e-6;
    for k in 0..model.num_params() {
        let saved = model.params()[k];
        model.params_mut()[k] = saved + h;
        let plus = get_objective(fg, gold, 1.0, 0, 1, bp)
            .value_and_gradient(model, None)
            .unwrap()
            .value;
        model.params_mut()[k] = saved - h;
        let minus = get_objective(fg, gold, 1.0, 0, 1, bp)
            .value_and_gradient(model, None)
            .unwrap()
            .value;
        model.params_mut()[k] = saved;

        let numerical = (plus - minus) / (2.0 * h);
        assert!(
            (numerical - grad[k]).abs() < 1e-5,
            "param {k}: analytic {} vs numerical {}",
            grad[k],
            numerical
        );
    }
}

#[test]
fn chain_log_likelihood_is_nonpositive() {
    for latent in [false, true] {
        let mut model = FgModel::new();
        let (fg, gold, _) = chain_example(&mut model, latent);
        randomize(&mut model, 17);
        let eval = get_objective(&fg, &gold, 1.0, 0, 1, BpConfig::default())
            .value_and_gradient(&model, None)
            .unwrap();
        assert!(
            eval.log_likelihood <= LL_TOLERANCE,
            "latent={latent}: {}",
            eval.log_likelihood
        );
    }
}

#[test]
fn chain_gradient_matches_finite_differences() {
    let mut model = FgModel::new();
    let (fg, gold, _) = chain_example(&mut model, false);
    randomize(&mut model, 23);
    check_objective_gradient(&fg, &gold, &mut model);
}

#[test]
fn latent_chain_gradient_matches_finite_differences() {
    // Marginal likelihood: the latent middle variable stays free in both
    // objective graphs, through the same formula.
    let mut model = FgModel::new();
    let (fg, gold, _) = chain_example(&mut model, true);
    randomize(&mut model, 29);
    check_objective_gradient(&fg, &gold, &mut model);
}

/// A dependency-tree CRF over 2 tokens: the global factor plus one
/// exponential-family unary per link variable.
fn dep_example(model: &mut FgModel) -> (FactorGraph, VarConfig) {
    let mut fg = FactorGraph::new();
    let (_, links, _) = ProjDepTreeFactor::attach(&mut fg, 2, true).unwrap();
    let link_vars: Vec<VarId> = fg.var_ids().collect();

    for &v in &link_vars {
        let name = fg.var(v).name.clone();
        let vs = fg.var_set(&[v]).unwrap();
        let features = (0..2)
            .map(|s| {
                let ix = model.feature(&format!("{name}:{s}")).unwrap();
                [(ix, 1.0)].into_iter().collect::<FeatureVec>()
            })
            .collect();
        fg.add_factor(Factor::ExpFamily(ExpFamilyFactor::new(vs, features)))
            .unwrap();
    }

    // Gold tree: wall → 0, 0 → 1.
    let mut gold = VarConfig::new();
    for &v in &link_vars {
        gold.set(v, FALSE);
    }
    gold.set(links.link(None, 0), TRUE);
    gold.set(links.link(Some(0), 1), TRUE);
    (fg, gold)
}

#[test]
fn dep_tree_crf_log_likelihood_is_nonpositive() {
    let mut model = FgModel::new();
    let (fg, gold) = dep_example(&mut model);
    randomize(&mut model, 31);
    let eval = get_objective(&fg, &gold, 1.0, 0, 1, BpConfig::default())
        .value_and_gradient(&model, None)
        .unwrap();
    assert!(eval.log_likelihood <= LL_TOLERANCE);
    // The partition dominates the single tree's score, so strictly below.
    assert!(eval.log_likelihood < 0.0);
}

#[test]
fn dep_tree_crf_gradient_matches_finite_differences() {
    // The global factor contributes no feature gradient of its own, but
    // the gradient it shapes through the beliefs must still be exact.
    let mut model = FgModel::new();
    let (fg, gold) = dep_example(&mut model);
    randomize(&mut model, 37);
    check_objective_gradient(&fg, &gold, &mut model);
}
