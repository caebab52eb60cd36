//! # CRF objective
//!
//! The (marginal) conditional log-likelihood of one training example:
//!
//! ```text
//! ℓ(θ) = log Z(clamped) − log Z(less clamped)
//! ```
//!
//! where the clamped graph fixes predicted and observed variables to the
//! gold assignment (latents stay free) and the less-clamped graph fixes
//! only the observed variables. With no latent variables the first term
//! degenerates to the gold score through the same formula — there is no
//! separate numerical path.
//!
//! The gradient is (observed − expected) sufficient statistics: every
//! exponential-family factor contributes its expected feature counts
//! under the two runs with opposite signs. Global factors carry no
//! feature parameters and contribute nothing directly; they shape the
//! gradient only through the beliefs.

use tracing::debug;

use marginalia_infer::bp::{BeliefPropagation, BpConfig, BpSchedule};
use marginalia_infer::graph::FactorGraph;
use marginalia_infer::var::VarKind;
use marginalia_infer::varset::VarConfig;

use crate::error::TrainError;
use crate::model::FgModel;

/// On an exact (tree) schedule the log-likelihood of a normalized model
/// cannot exceed zero; beyond this tolerance the violation is reported.
pub const LL_TOLERANCE: f64 = 1e-8;

/// One example's objective evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveEval {
    /// `weight × log-likelihood` — the quantity the optimizer sees.
    pub value: f64,
    /// The unweighted log-likelihood.
    pub log_likelihood: f64,
    /// Whether the likelihood exceeded [`LL_TOLERANCE`]. On a flood
    /// schedule this flags approximate inference, not a defect.
    pub positive: bool,
}

/// The optimizer-facing objective for one (factor graph, gold
/// assignment) pair.
#[derive(Debug)]
pub struct CrfObjective<'a> {
    fg: &'a FactorGraph,
    gold: &'a VarConfig,
    weight: f64,
    bp: BpConfig,
    cur_iter: usize,
    max_iter: usize,
}

/// Build the primary optimizer-facing objective. `weight` scales both
/// value and gradient; `cur_iter` / `max_iter` give the surrounding
/// optimization step for diagnostics.
pub fn get_objective<'a>(
    fg: &'a FactorGraph,
    gold: &'a VarConfig,
    weight: f64,
    cur_iter: usize,
    max_iter: usize,
    bp: BpConfig,
) -> CrfObjective<'a> {
    CrfObjective {
        fg,
        gold,
        weight,
        bp,
        cur_iter,
        max_iter,
    }
}

impl CrfObjective<'_> {
    /// Evaluate the weighted log-likelihood and, if `grad` is given, add
    /// the weighted gradient into it.
    pub fn value_and_gradient(
        &self,
        model: &FgModel,
        mut grad: Option<&mut [f64]>,
    ) -> Result<ObjectiveEval, TrainError> {
        let numerator_cfg = self.gold.restricted(|id| {
            matches!(
                self.fg.var(id).kind,
                VarKind::Predicted | VarKind::Observed
            )
        });
        let denominator_cfg = self
            .gold
            .restricted(|id| matches!(self.fg.var(id).kind, VarKind::Observed));

        let clamped = self.fg.clamped(&numerator_cfg)?;
        let less_clamped = self.fg.clamped(&denominator_cfg)?;

        let params = model.params();
        let (num_beliefs, _) =
            BeliefPropagation::new(&clamped, Some(params), self.bp)?.run()?;
        let (den_beliefs, _) =
            BeliefPropagation::new(&less_clamped, Some(params), self.bp)?.run()?;

        let log_likelihood = num_beliefs.log_partition - den_beliefs.log_partition;
        let positive = log_likelihood > LL_TOLERANCE;
        if positive {
            debug!(
                log_likelihood,
                cur_iter = self.cur_iter,
                max_iter = self.max_iter,
                exact = (self.bp.schedule == BpSchedule::TreeLike),
                "positive log-likelihood"
            );
        }

        if let Some(grad) = grad.as_deref_mut() {
            accumulate_expected_features(&clamped, &num_beliefs, self.weight, grad);
            accumulate_expected_features(&less_clamped, &den_beliefs, -self.weight, grad);
        }

        Ok(ObjectiveEval {
            value: self.weight * log_likelihood,
            log_likelihood,
            positive,
        })
    }
}

/// Add `multiplier × E_b[f]` for every exponential-family factor of the
/// graph into `grad`.
fn accumulate_expected_features(
    fg: &FactorGraph,
    beliefs: &marginalia_infer::bp::Beliefs,
    multiplier: f64,
    grad: &mut [f64],
) {
    for (i, fid) in fg.factor_ids().enumerate() {
        let factor = fg.factor(fid);
        let probs = beliefs.factor_beliefs[i].as_ref().map(|t| t.to_reals());
        factor.accumulate_gradient(probs.as_deref(), multiplier, grad);
    }
}
