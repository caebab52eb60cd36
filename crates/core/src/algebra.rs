//! # Semiring algebras
//!
//! Every quantity that flows through inference — potentials, messages,
//! beliefs, partition functions, chart cells — is an `f64` whose *meaning*
//! is given by an [`Algebra`]. The algorithms upstream are written once
//! against this interface and behave identically under every instance,
//! differing only in numerical range:
//!
//! - [`Algebra::Real`] — the value is the number itself. Fast, but products
//!   of many small probabilities underflow.
//! - [`Algebra::Log`] — the value is `ln(x)` for a non-negative `x`.
//!   Products become sums; sums become stable log-adds. Cannot represent
//!   negative numbers, so it cannot host gradients.
//! - [`Algebra::SignedLog`] — log magnitude plus a sign, so subtraction is
//!   closed. This is the adjoint arithmetic for log-space forward passes.
//!
//! ## Example
//!
//! ```rust
//! use marginalia_core::algebra::Algebra;
//!
//! let log = Algebra::Log;
//! let a = log.from_real(1e-160);
//! let b = log.from_real(1e-160);
//! // 1e-160 * 1e-160 underflows in real arithmetic but not here.
//! let product = log.times(a, b);
//! assert!((log.to_log_prob(product) - (-320.0 * 10f64.ln())).abs() < 1e-9);
//! ```

/// Stable `ln(e^a + e^b)`.
#[inline]
pub fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Stable `ln(e^a - e^b)`. Requires `a >= b`; returns NaN otherwise.
#[inline]
pub fn log_subtract(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a == f64::NEG_INFINITY {
        // b > a: the difference is negative and unrepresentable here.
        return f64::NAN;
    }
    let d = b - a;
    if d == 0.0 {
        return f64::NEG_INFINITY;
    }
    a + (-d.exp()).ln_1p()
}

/// `ln(e^a - e^b)` with the clamping policy for numerical boundary cases:
/// if rounding error makes the subtrahend exceed the minuend, the result is
/// clamped to `-inf` (the additive identity) and the flag is set so callers
/// can record a diagnostic instead of emitting NaN.
#[inline]
pub fn safe_log_subtract(a: f64, b: f64) -> (f64, bool) {
    if b > a {
        (f64::NEG_INFINITY, true)
    } else {
        (log_subtract(a, b), false)
    }
}

/// Sign packing for [`Algebra::SignedLog`].
///
/// A signed-log value stores `ln|x|` in an `f64` whose least significant
/// mantissa bit carries the sign of `x` (set = negative). Zero is `-inf`
/// and carries no sign. The packing costs one ulp of magnitude precision,
/// which is far below the tolerance of any downstream computation.
mod signed {
    const SIGN_BIT: u64 = 1;

    #[inline]
    pub fn pack(negative: bool, ln_mag: f64) -> f64 {
        if ln_mag == f64::NEG_INFINITY || ln_mag.is_nan() {
            return ln_mag;
        }
        let bits = ln_mag.to_bits();
        f64::from_bits(if negative { bits | SIGN_BIT } else { bits & !SIGN_BIT })
    }

    #[inline]
    pub fn is_negative(v: f64) -> bool {
        v != f64::NEG_INFINITY && !v.is_nan() && v.to_bits() & SIGN_BIT == SIGN_BIT
    }

    #[inline]
    pub fn ln_mag(v: f64) -> f64 {
        if v == f64::NEG_INFINITY || v.is_nan() {
            v
        } else {
            f64::from_bits(v.to_bits() & !SIGN_BIT)
        }
    }
}

/// A closed set of semiring arithmetics over `f64` representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algebra {
    /// Plain real arithmetic.
    Real,
    /// Log-space arithmetic over non-negative reals.
    #[default]
    Log,
    /// Log-space arithmetic with a packed sign; closed under subtraction.
    SignedLog,
}

impl Algebra {
    /// The additive identity.
    #[inline]
    pub fn zero(self) -> f64 {
        match self {
            Algebra::Real => 0.0,
            Algebra::Log | Algebra::SignedLog => f64::NEG_INFINITY,
        }
    }

    /// The multiplicative identity.
    #[inline]
    pub fn one(self) -> f64 {
        match self {
            Algebra::Real => 1.0,
            Algebra::Log | Algebra::SignedLog => 0.0,
        }
    }

    #[inline]
    pub fn is_zero(self, v: f64) -> bool {
        match self {
            Algebra::Real => v == 0.0,
            Algebra::Log | Algebra::SignedLog => v == f64::NEG_INFINITY,
        }
    }

    /// Semiring addition.
    #[inline]
    pub fn plus(self, a: f64, b: f64) -> f64 {
        match self {
            Algebra::Real => a + b,
            Algebra::Log => log_add(a, b),
            Algebra::SignedLog => {
                if a == f64::NEG_INFINITY {
                    return b;
                }
                if b == f64::NEG_INFINITY {
                    return a;
                }
                let (na, la) = (signed::is_negative(a), signed::ln_mag(a));
                let (nb, lb) = (signed::is_negative(b), signed::ln_mag(b));
                if na == nb {
                    signed::pack(na, log_add(la, lb))
                } else if la > lb {
                    signed::pack(na, log_subtract(la, lb))
                } else if lb > la {
                    signed::pack(nb, log_subtract(lb, la))
                } else {
                    f64::NEG_INFINITY
                }
            }
        }
    }

    /// Semiring multiplication.
    #[inline]
    pub fn times(self, a: f64, b: f64) -> f64 {
        match self {
            Algebra::Real => a * b,
            Algebra::Log => {
                if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
                    f64::NEG_INFINITY
                } else {
                    a + b
                }
            }
            Algebra::SignedLog => {
                if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
                    return f64::NEG_INFINITY;
                }
                let (na, la) = (signed::is_negative(a), signed::ln_mag(a));
                let (nb, lb) = (signed::is_negative(b), signed::ln_mag(b));
                signed::pack(na != nb, la + lb)
            }
        }
    }

    /// Division. An additive-identity numerator yields the additive
    /// identity in every algebra, even when the denominator is also zero —
    /// a zero/zero message pair signals a hard constraint and must
    /// propagate zero, never NaN. A zero denominator under a nonzero
    /// numerator keeps IEEE semantics (infinity) so misuse stays visible.
    #[inline]
    pub fn divide(self, a: f64, b: f64) -> f64 {
        if self.is_zero(a) {
            return self.zero();
        }
        match self {
            Algebra::Real => a / b,
            Algebra::Log => a - b,
            Algebra::SignedLog => {
                let (na, la) = (signed::is_negative(a), signed::ln_mag(a));
                let (nb, lb) = (signed::is_negative(b), signed::ln_mag(b));
                signed::pack(na != nb, la - lb)
            }
        }
    }

    /// Subtraction. In `Log` this is a stable log-subtract and yields NaN
    /// when the result would be negative; use [`safe_log_subtract`] where
    /// the clamping policy applies. `SignedLog` and `Real` are closed.
    #[inline]
    pub fn minus(self, a: f64, b: f64) -> f64 {
        match self {
            Algebra::Real => a - b,
            Algebra::Log => log_subtract(a, b),
            Algebra::SignedLog => self.plus(a, self.neg(b)),
        }
    }

    /// Additive inverse. Unrepresentable in `Log` for nonzero values
    /// (yields NaN).
    #[inline]
    pub fn neg(self, a: f64) -> f64 {
        match self {
            Algebra::Real => -a,
            Algebra::Log => {
                if a == f64::NEG_INFINITY {
                    a
                } else {
                    f64::NAN
                }
            }
            Algebra::SignedLog => {
                if a == f64::NEG_INFINITY {
                    a
                } else {
                    signed::pack(!signed::is_negative(a), signed::ln_mag(a))
                }
            }
        }
    }

    /// Interpret a raw value as the real number it represents.
    #[inline]
    pub fn to_real(self, v: f64) -> f64 {
        match self {
            Algebra::Real => v,
            Algebra::Log => v.exp(),
            Algebra::SignedLog => {
                let mag = signed::ln_mag(v).exp();
                if signed::is_negative(v) {
                    -mag
                } else {
                    mag
                }
            }
        }
    }

    /// Encode a real number into this algebra. Negative inputs are
    /// unrepresentable in `Log` and yield NaN.
    #[inline]
    pub fn from_real(self, r: f64) -> f64 {
        match self {
            Algebra::Real => r,
            Algebra::Log => r.ln(),
            Algebra::SignedLog => {
                if r == 0.0 {
                    f64::NEG_INFINITY
                } else {
                    signed::pack(r < 0.0, r.abs().ln())
                }
            }
        }
    }

    /// The natural log of the represented (non-negative) value. NaN for a
    /// negative signed-log value.
    #[inline]
    pub fn to_log_prob(self, v: f64) -> f64 {
        match self {
            Algebra::Real => v.ln(),
            Algebra::Log => v,
            Algebra::SignedLog => {
                if signed::is_negative(v) {
                    f64::NAN
                } else {
                    signed::ln_mag(v)
                }
            }
        }
    }

    /// Encode a log-probability into this algebra.
    #[inline]
    pub fn from_log_prob(self, lp: f64) -> f64 {
        match self {
            Algebra::Real => lp.exp(),
            Algebra::Log => lp,
            Algebra::SignedLog => signed::pack(false, lp),
        }
    }

    /// Re-encode a value of this algebra into `target`. Goes through log
    /// space where possible so tiny masses survive the trip.
    #[inline]
    pub fn convert(self, v: f64, target: Algebra) -> f64 {
        if self == target {
            return v;
        }
        match (self, target) {
            (Algebra::SignedLog, _) if signed::is_negative(v) => match target {
                Algebra::Real => self.to_real(v),
                // A negative value has no Log encoding.
                _ => f64::NAN,
            },
            (_, Algebra::Real) => self.to_real(v),
            (Algebra::Real, _) => target.from_real(v),
            _ => target.from_log_prob(self.to_log_prob(v)),
        }
    }

    /// The algebra adjoints are accumulated in when the forward pass runs
    /// in `self`. Gradients of log-space computations can be negative, so
    /// `Log` promotes to `SignedLog`.
    #[inline]
    pub fn grad_algebra(self) -> Algebra {
        match self {
            Algebra::Real => Algebra::Real,
            Algebra::Log | Algebra::SignedLog => Algebra::SignedLog,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Algebra; 3] = [Algebra::Real, Algebra::Log, Algebra::SignedLog];

    fn roundtrip(alg: Algebra, r: f64) -> f64 {
        alg.to_real(alg.from_real(r))
    }

    #[test]
    fn identities() {
        for alg in ALL {
            let x = alg.from_real(0.37);
            assert!((alg.to_real(alg.plus(x, alg.zero())) - 0.37).abs() < 1e-12);
            assert!((alg.to_real(alg.times(x, alg.one())) - 0.37).abs() < 1e-12);
            assert!(alg.is_zero(alg.times(x, alg.zero())));
        }
    }

    #[test]
    fn arithmetic_matches_real() {
        for alg in ALL {
            let a = alg.from_real(0.3);
            let b = alg.from_real(0.2);
            assert!((alg.to_real(alg.plus(a, b)) - 0.5).abs() < 1e-12);
            assert!((alg.to_real(alg.times(a, b)) - 0.06).abs() < 1e-12);
            assert!((alg.to_real(alg.divide(a, b)) - 1.5).abs() < 1e-12);
        }
    }

    #[test]
    fn log_add_is_stable_for_tiny_masses() {
        let a = -800.0;
        let b = -800.0;
        let s = log_add(a, b);
        assert!((s - (a + 2f64.ln())).abs() < 1e-12);
    }

    #[test]
    fn log_subtract_edge_cases() {
        assert_eq!(log_subtract(-1.0, f64::NEG_INFINITY), -1.0);
        assert_eq!(log_subtract(-1.0, -1.0), f64::NEG_INFINITY);
        assert!(log_subtract(-2.0, -1.0).is_nan());

        let (v, clamped) = safe_log_subtract(-2.0, -1.0);
        assert_eq!(v, f64::NEG_INFINITY);
        assert!(clamped);
        let (v, clamped) = safe_log_subtract(-1.0, -2.0);
        assert!(!clamped);
        assert!((v.exp() - ((-1.0f64).exp() - (-2.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn signed_log_subtraction() {
        let alg = Algebra::SignedLog;
        let a = alg.from_real(0.2);
        let b = alg.from_real(0.5);
        let d = alg.minus(a, b);
        assert!((alg.to_real(d) + 0.3).abs() < 1e-12);
        // and back to zero
        let z = alg.plus(d, alg.from_real(0.3));
        assert!(alg.to_real(z).abs() < 1e-12);
    }

    #[test]
    fn signed_log_negative_products() {
        let alg = Algebra::SignedLog;
        let a = alg.from_real(-0.25);
        let b = alg.from_real(-4.0);
        assert!((alg.to_real(alg.times(a, b)) - 1.0).abs() < 1e-12);
        let c = alg.from_real(2.0);
        assert!((alg.to_real(alg.times(a, c)) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn divide_propagates_hard_zero() {
        for alg in ALL {
            let q = alg.divide(alg.zero(), alg.zero());
            assert!(alg.is_zero(q), "{alg:?}: zero/zero must stay zero");
            let h = alg.divide(alg.zero(), alg.from_real(0.7));
            assert!(alg.is_zero(h));
        }
    }

    #[test]
    fn from_real_roundtrips() {
        for alg in ALL {
            for r in [0.0, 1.0, 0.001, 123.456] {
                assert!((roundtrip(alg, r) - r).abs() < 1e-9 * r.max(1.0));
            }
        }
        // negative values roundtrip where representable
        for alg in [Algebra::Real, Algebra::SignedLog] {
            assert!((roundtrip(alg, -2.5) + 2.5).abs() < 1e-12);
        }
    }

    #[test]
    fn convert_between_algebras() {
        let v = Algebra::Log.from_real(1e-200);
        let r = Algebra::Log.convert(v, Algebra::SignedLog);
        assert!(
            (Algebra::SignedLog.to_log_prob(r) - Algebra::Log.to_log_prob(v)).abs() < 1e-12
        );
        // negative signed-log into Log is unrepresentable
        let neg = Algebra::SignedLog.from_real(-1.0);
        assert!(Algebra::SignedLog.convert(neg, Algebra::Log).is_nan());
    }

    #[test]
    fn grad_algebra_promotion() {
        assert_eq!(Algebra::Real.grad_algebra(), Algebra::Real);
        assert_eq!(Algebra::Log.grad_algebra(), Algebra::SignedLog);
        assert_eq!(Algebra::SignedLog.grad_algebra(), Algebra::SignedLog);
    }
}
