//! # Gradient checking
//!
//! Central-difference verification of analytic gradients. Perturbations and
//! comparisons happen on the *real-valued* view of every input entry, so
//! the same check exercises a graph regardless of which algebra it runs in.

use marginalia_core::Tensor;

use crate::graph::ModuleGraph;

/// A mismatch between the analytic and numerical gradient.
#[derive(Debug)]
pub struct GradCheckError {
    /// Which external input disagreed.
    pub input: usize,
    /// Flat entry index within that input.
    pub entry: usize,
    pub analytical: f64,
    pub numerical: f64,
    pub diff: f64,
}

impl std::fmt::Display for GradCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gradient mismatch at input[{}][{}]: analytical={}, numerical={}, diff={}",
            self.input, self.entry, self.analytical, self.numerical, self.diff
        )
    }
}

impl std::error::Error for GradCheckError {}

/// Evaluate the graph's scalar output as a real number for the given
/// real-valued inputs.
fn eval_real(graph: &mut ModuleGraph, reals: &[Vec<f64>], templates: &[Tensor]) -> f64 {
    let bound: Vec<Tensor> = reals
        .iter()
        .zip(templates.iter())
        .map(|(r, t)| {
            Tensor::from_data(
                t.algebra(),
                t.dims().to_vec(),
                r.iter().map(|&x| t.algebra().from_real(x)).collect(),
            )
        })
        .collect();
    let out = graph.forward(&bound);
    out.algebra().to_real(out.as_scalar())
}

/// Check every analytic input gradient of a scalar-output graph against a
/// central difference `(f(x+h) - f(x-h)) / 2h`.
///
/// Errors use the relative rule: a mismatch is reported only when both the
/// absolute difference and the difference scaled by
/// `max(|analytical|, |numerical|, 1)` exceed `tolerance`.
pub fn grad_check(
    graph: &mut ModuleGraph,
    inputs: &[Tensor],
    step: f64,
    tolerance: f64,
) -> Result<(), GradCheckError> {
    // Analytic pass.
    graph.forward(inputs);
    graph.backward();
    let analytic: Vec<Option<Vec<f64>>> = (0..inputs.len())
        .map(|i| {
            graph.input_adjoint(i).map(|adj| {
                adj.data()
                    .iter()
                    .map(|&v| adj.algebra().to_real(v))
                    .collect()
            })
        })
        .collect();

    let base: Vec<Vec<f64>> = inputs.iter().map(|t| t.to_reals()).collect();

    for (i, input) in inputs.iter().enumerate() {
        for k in 0..input.len() {
            let mut plus = base.clone();
            plus[i][k] += step;
            let mut minus = base.clone();
            minus[i][k] -= step;

            let f_plus = eval_real(graph, &plus, inputs);
            let f_minus = eval_real(graph, &minus, inputs);
            let numerical = (f_plus - f_minus) / (2.0 * step);
            let analytical = analytic[i]
                .as_ref()
                .map(|g| g[k])
                .unwrap_or(0.0);

            let diff = (numerical - analytical).abs();
            let scale = analytical.abs().max(numerical.abs()).max(1.0);
            if diff > tolerance && diff / scale > tolerance {
                return Err(GradCheckError {
                    input: i,
                    entry: k,
                    analytical,
                    numerical,
                    diff,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::Algebra;

    fn ratio_sum_graph() -> ModuleGraph {
        // out = sum(a ⊘ b) ⊕ product(a)
        let mut g = ModuleGraph::new();
        let a = g.input();
        let b = g.input();
        let ratio = g.divide(a, b);
        let s = g.sum(ratio);
        let p = g.product(a);
        let out = g.plus(s, p);
        g.mark_output(out);
        g
    }

    #[test]
    fn grad_check_passes_in_real_and_log() {
        for alg in [Algebra::Real, Algebra::Log] {
            let mut g = ratio_sum_graph();
            let a = Tensor::from_reals(alg, &[0.4, 0.9]);
            let b = Tensor::from_reals(alg, &[0.7, 0.3]);
            grad_check(&mut g, &[a, b], 1e-8, 1e-5)
                .unwrap_or_else(|e| panic!("{alg:?}: {e}"));
        }
    }

    #[test]
    fn sparse_gradients_check_cleanly() {
        // select leaves most entries with a zero gradient; both sides of
        // the comparison must agree on those zeros.
        let mut g = ModuleGraph::new();
        let x = g.input();
        let out = g.select(x, 0);
        g.mark_output(out);
        let alg = Algebra::Real;
        let x0 = Tensor::from_reals(alg, &[0.5, 0.25]);
        grad_check(&mut g, &[x0], 1e-8, 1e-5).unwrap();
    }
}
