//! # Batch objective
//!
//! The (value, gradient) oracle an optimizer drives. Examples are
//! independent: each worker builds and owns its example's factor graphs,
//! reads the shared parameter vector without locking, and accumulates
//! into a thread-local gradient; the per-thread accumulators are merged
//! at batch end.
//!
//! A failure while processing one example never corrupts shared state:
//! it is caught at the example boundary, logged with the example index,
//! excluded from the step's accumulation, and the batch continues.

use rayon::prelude::*;
use tracing::warn;

use marginalia_infer::bp::BpConfig;
use marginalia_infer::graph::FactorGraph;
use marginalia_infer::varset::VarConfig;

use crate::error::TrainError;
use crate::model::FgModel;
use crate::objective::get_objective;

/// Builds a factor graph and gold assignment from one example. Feature
/// extraction and corpus representation live behind this seam.
pub trait FgBuilder: Sync {
    type Example: Sync;

    fn build(&self, example: &Self::Example) -> Result<(FactorGraph, VarConfig), TrainError>;
}

/// Batch-objective configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub bp: BpConfig,
    /// Per-example weight applied to value and gradient.
    pub example_weight: f64,
    /// How many positive-log-likelihood warnings to emit before going
    /// quiet for the rest of the batch.
    pub max_positive_ll_warnings: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            bp: BpConfig::default(),
            example_weight: 1.0,
            max_positive_ll_warnings: 5,
        }
    }
}

/// What happened during one batch evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchDiagnostics {
    pub examples: usize,
    /// Examples excluded after a per-example failure.
    pub failures: usize,
    /// Examples whose log-likelihood exceeded tolerance.
    pub positive_ll: usize,
}

struct Partial {
    value: f64,
    grad: Vec<f64>,
    failures: usize,
    positive_ll: usize,
}

/// Evaluate the summed weighted log-likelihood of a batch and its
/// gradient. `cur_iter` / `max_iter` locate the call within the outer
/// optimization loop.
pub fn batch_objective<B: FgBuilder>(
    builder: &B,
    examples: &[B::Example],
    model: &FgModel,
    config: &TrainConfig,
    cur_iter: usize,
    max_iter: usize,
) -> (f64, Vec<f64>, BatchDiagnostics) {
    let n_params = model.num_params();

    let merged = examples
        .par_iter()
        .enumerate()
        .fold(
            || Partial {
                value: 0.0,
                grad: vec![0.0; n_params],
                failures: 0,
                positive_ll: 0,
            },
            |mut acc, (index, example)| {
                let result = builder.build(example).and_then(|(fg, gold)| {
                    get_objective(
                        &fg,
                        &gold,
                        config.example_weight,
                        cur_iter,
                        max_iter,
                        config.bp,
                    )
                    .value_and_gradient(model, Some(&mut acc.grad))
                });
                match result {
                    Ok(eval) => {
                        acc.value += eval.value;
                        if eval.positive {
                            acc.positive_ll += 1;
                        }
                    }
                    Err(error) => {
                        warn!(example = index, %error, "skipping failed example");
                        acc.failures += 1;
                    }
                }
                acc
            },
        )
        .reduce(
            || Partial {
                value: 0.0,
                grad: vec![0.0; n_params],
                failures: 0,
                positive_ll: 0,
            },
            |mut a, b| {
                a.value += b.value;
                for (g, h) in a.grad.iter_mut().zip(b.grad.iter()) {
                    *g += h;
                }
                a.failures += b.failures;
                a.positive_ll += b.positive_ll;
                a
            },
        );

    let diagnostics = BatchDiagnostics {
        examples: examples.len(),
        failures: merged.failures,
        positive_ll: merged.positive_ll,
    };
    if diagnostics.positive_ll > 0 {
        let shown = diagnostics.positive_ll.min(config.max_positive_ll_warnings);
        warn!(
            count = diagnostics.positive_ll,
            shown,
            cur_iter,
            "examples with positive log-likelihood (approximate inference or bad gold)"
        );
    }

    (merged.value, merged.grad, diagnostics)
}
