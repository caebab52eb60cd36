//! # Differentiable operations
//!
//! [`Op`] is the closed set of operations a module graph is built from.
//! Each operation knows how to:
//!
//! - execute forward (compute its output tensor from its input tensors),
//! - compute its vector-Jacobian product (VJP) for reverse-mode autodiff.
//!
//! Forward values live in the graph's [`Algebra`]; adjoints live in
//! [`Algebra::grad_algebra`] of it, because gradients of log-space values
//! can be negative. The VJP rules below are the ordinary real-valued
//! derivative rules, *executed* in the gradient algebra.
//!
//! | Op | Forward | Backward |
//! |----|---------|----------|
//! | Plus | a ⊕ b | adjoint flows to both |
//! | Times | a ⊗ b | ∂a = adj ⊗ b, ∂b = adj ⊗ a |
//! | Divide | a ⊘ b | ∂a = adj ⊘ b, ∂b = −adj ⊗ c ⊘ b |
//! | GuardedDivide | a ⊘ b, but 0 where a = 0 | zero gradient where a = 0 |
//! | Sum | ⊕ of entries | broadcast adjoint |
//! | Product | ⊗ of entries | prefix/suffix products (zero-safe) |
//! | Select | one entry | scatter adjoint |
//!
//! `GuardedDivide` is the keep-left-if-zero operator: entries hard-fixed to
//! the additive identity stay at the identity and receive *no* gradient —
//! structurally forbidden configurations must not become 0/0 NaN during
//! backpropagation.

use std::sync::Arc;

use marginalia_core::{Algebra, Tensor};

/// An operation implemented outside the closed [`Op`] set — structured
/// dynamic programs whose forward and backward sweeps are hand-written
/// (e.g. inside-outside over a parse chart).
///
/// `backward` receives the forward inputs, the forward output, and the
/// output adjoint (in the gradient algebra of the output's algebra), and
/// returns one adjoint tensor per input. Implementations may recompute any
/// intermediate state they need.
pub trait ExternOp: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn forward(&self, inputs: &[&Tensor]) -> Tensor;
    fn backward(&self, inputs: &[&Tensor], output: &Tensor, adjoint: &Tensor) -> Vec<Tensor>;
}

/// Differentiable operations for module graphs.
#[derive(Debug, Clone)]
pub enum Op {
    /// Placeholder bound to the graph's i-th external input.
    Input { index: usize },
    /// A constant tensor; receives no gradient.
    Const(Tensor),
    /// Elementwise semiring addition (scalars broadcast).
    Plus,
    /// Elementwise subtraction (scalars broadcast).
    Minus,
    /// Elementwise semiring multiplication (scalars broadcast).
    Times,
    /// Elementwise division (scalars broadcast).
    Divide,
    /// Elementwise division that keeps the left operand where it is the
    /// additive identity and blocks gradient flow at those entries.
    GuardedDivide,
    /// Elementwise subtraction clamped at the additive identity: where the
    /// subtrahend exceeds the minuend the result is zero and no gradient
    /// flows (log-subtract underflow is policy, not an exception).
    ClampedMinus,
    /// Semiring sum of all entries, producing a scalar.
    Sum,
    /// Semiring product of all entries, producing a scalar.
    Product,
    /// A single entry of the input, producing a scalar.
    Select { index: usize },
    /// A contiguous sub-vector of the (flat) input.
    Slice { start: usize, len: usize },
    /// An externally implemented operation.
    Extern(Arc<dyn ExternOp>),
}

impl Op {
    /// Number of inputs this operation expects; `None` for variadic.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Op::Input { .. } | Op::Const(_) => Some(0),
            Op::Plus | Op::Minus | Op::Times | Op::Divide | Op::GuardedDivide
            | Op::ClampedMinus => Some(2),
            Op::Sum | Op::Product | Op::Select { .. } | Op::Slice { .. } => Some(1),
            Op::Extern(_) => None,
        }
    }

    /// Execute the forward pass. `Input` nodes are resolved by the graph
    /// and never reach this method.
    pub fn forward(&self, inputs: &[&Tensor]) -> Tensor {
        match self {
            Op::Input { index } => panic!("unbound input {index}"),
            Op::Const(t) => t.clone(),
            Op::Plus => inputs[0].plus(inputs[1]),
            Op::Minus => inputs[0].minus(inputs[1]),
            Op::Times => inputs[0].times(inputs[1]),
            Op::Divide => inputs[0].divide(inputs[1]),
            Op::GuardedDivide => {
                let (a, b) = (inputs[0], inputs[1]);
                let alg = a.algebra();
                assert_eq!(a.dims(), b.dims(), "GuardedDivide shape mismatch");
                let data = a
                    .data()
                    .iter()
                    .zip(b.data().iter())
                    .map(|(&x, &y)| if alg.is_zero(x) { alg.zero() } else { alg.divide(x, y) })
                    .collect();
                Tensor::from_data(alg, a.dims().to_vec(), data)
            }
            Op::ClampedMinus => {
                let (a, b) = (inputs[0], inputs[1]);
                let alg = a.algebra();
                // Scalars broadcast on either side, like the other binary ops.
                let dims = if a.is_scalar() { b.dims() } else { a.dims() };
                let size: usize = dims.iter().product();
                let data = (0..size)
                    .map(|k| {
                        let x = a.get_flat(if a.is_scalar() { 0 } else { k });
                        let y = b.get_flat(if b.is_scalar() { 0 } else { k });
                        if alg.to_real(y) > alg.to_real(x) {
                            alg.zero()
                        } else {
                            alg.minus(x, y)
                        }
                    })
                    .collect();
                Tensor::from_data(alg, dims.to_vec(), data)
            }
            Op::Sum => Tensor::scalar(inputs[0].algebra(), inputs[0].sum()),
            Op::Product => Tensor::scalar(inputs[0].algebra(), inputs[0].product()),
            Op::Select { index } => Tensor::scalar(inputs[0].algebra(), inputs[0].get_flat(*index)),
            Op::Slice { start, len } => Tensor::vector(
                inputs[0].algebra(),
                inputs[0].data()[*start..*start + *len].to_vec(),
            ),
            Op::Extern(op) => op.forward(inputs),
        }
    }

    /// Vector-Jacobian product: one adjoint per input, in the gradient
    /// algebra.
    pub fn vjp(&self, inputs: &[&Tensor], output: &Tensor, adjoint: &Tensor) -> Vec<Tensor> {
        let ga = adjoint.algebra();
        match self {
            Op::Input { .. } | Op::Const(_) => vec![],
            Op::Plus => {
                vec![
                    reduce_like(inputs[0], adjoint.clone()),
                    reduce_like(inputs[1], adjoint.clone()),
                ]
            }
            Op::Minus => {
                let negated = adjoint.map(|v| ga.neg(v));
                vec![
                    reduce_like(inputs[0], adjoint.clone()),
                    reduce_like(inputs[1], negated),
                ]
            }
            Op::Times => {
                let a = inputs[0].to_algebra(ga);
                let b = inputs[1].to_algebra(ga);
                vec![
                    reduce_like(inputs[0], adjoint.times(&b)),
                    reduce_like(inputs[1], adjoint.times(&a)),
                ]
            }
            Op::Divide => {
                let b = inputs[1].to_algebra(ga);
                let c = output.to_algebra(ga);
                let da = adjoint.divide(&b);
                let db = adjoint.times(&c).divide(&b).map(|v| ga.neg(v));
                vec![reduce_like(inputs[0], da), reduce_like(inputs[1], db)]
            }
            Op::GuardedDivide => {
                let fa = inputs[0].algebra();
                let b = inputs[1].to_algebra(ga);
                let c = output.to_algebra(ga);
                let mut da = adjoint.divide(&b);
                let mut db = adjoint.times(&c).divide(&b).map(|v| ga.neg(v));
                for (k, &x) in inputs[0].data().iter().enumerate() {
                    if fa.is_zero(x) {
                        da.set_flat(k, ga.zero());
                        db.set_flat(k, ga.zero());
                    }
                }
                vec![da, db]
            }
            Op::Sum => {
                vec![Tensor::full(
                    ga,
                    inputs[0].dims().to_vec(),
                    adjoint.as_scalar(),
                )]
            }
            Op::Product => {
                // ∂/∂a_i = adj ⊗ Π_{j≠i} a_j, via prefix/suffix products so
                // inputs at the additive identity stay zero-safe.
                let fa = inputs[0].algebra();
                let vals = inputs[0].data();
                let n = vals.len();
                let mut prefix = vec![fa.one(); n + 1];
                for i in 0..n {
                    prefix[i + 1] = fa.times(prefix[i], vals[i]);
                }
                let mut suffix = vec![fa.one(); n + 1];
                for i in (0..n).rev() {
                    suffix[i] = fa.times(suffix[i + 1], vals[i]);
                }
                let adj = adjoint.as_scalar();
                let data = (0..n)
                    .map(|i| {
                        let others = fa.times(prefix[i], suffix[i + 1]);
                        ga.times(adj, fa.convert(others, ga))
                    })
                    .collect();
                vec![Tensor::from_data(ga, inputs[0].dims().to_vec(), data)]
            }
            Op::ClampedMinus => {
                let (a, b) = (inputs[0], inputs[1]);
                let fa = a.algebra();
                let size = output.len();
                let mut da_full = Tensor::zeros(ga, output.dims().to_vec());
                let mut db_full = Tensor::zeros(ga, output.dims().to_vec());
                for k in 0..size {
                    let x = a.get_flat(if a.is_scalar() { 0 } else { k });
                    let y = b.get_flat(if b.is_scalar() { 0 } else { k });
                    if fa.to_real(y) > fa.to_real(x) {
                        continue; // clamped entry: zero gradient
                    }
                    let adj = adjoint.get_flat(if adjoint.is_scalar() { 0 } else { k });
                    da_full.set_flat(k, adj);
                    db_full.set_flat(k, ga.neg(adj));
                }
                vec![reduce_like(inputs[0], da_full), reduce_like(inputs[1], db_full)]
            }
            Op::Select { index } => {
                let mut grad = Tensor::zeros(ga, inputs[0].dims().to_vec());
                grad.set_flat(*index, adjoint.as_scalar());
                vec![grad]
            }
            Op::Slice { start, len } => {
                let mut grad = Tensor::zeros(ga, inputs[0].dims().to_vec());
                for k in 0..*len {
                    grad.set_flat(start + k, adjoint.get_flat(k));
                }
                vec![grad]
            }
            Op::Extern(op) => op.backward(inputs, output, adjoint),
        }
    }
}

/// Collapse a broadcast adjoint back onto a scalar input's shape.
fn reduce_like(input: &Tensor, full: Tensor) -> Tensor {
    if input.is_scalar() && !full.is_scalar() {
        Tensor::scalar(full.algebra(), full.sum())
    } else {
        full
    }
}
