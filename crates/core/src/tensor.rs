//! # Semiring tensors
//!
//! A [`Tensor`] is a dense, row-major array of values tagged with the
//! [`Algebra`] that gives them meaning. Factor potential tables, messages,
//! beliefs, and dynamic-programming charts are all tensors.
//!
//! ## Example
//!
//! ```rust
//! use marginalia_core::{Algebra, Tensor};
//!
//! let mut t = Tensor::zeros(Algebra::Log, vec![2, 2]);
//! t.set(&[0, 1], Algebra::Log.from_real(0.25));
//! assert!((Algebra::Log.to_real(t.get(&[0, 1])) - 0.25).abs() < 1e-12);
//! assert!((Algebra::Log.to_real(t.sum()) - 0.25).abs() < 1e-12);
//! ```

use crate::algebra::Algebra;

/// Dense row-major array of semiring values.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    algebra: Algebra,
    dims: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// A tensor filled with the additive identity.
    pub fn zeros(algebra: Algebra, dims: Vec<usize>) -> Self {
        let size = dims.iter().product();
        Self {
            algebra,
            dims,
            data: vec![algebra.zero(); size],
        }
    }

    /// A tensor filled with the multiplicative identity.
    pub fn ones(algebra: Algebra, dims: Vec<usize>) -> Self {
        let size = dims.iter().product();
        Self {
            algebra,
            dims,
            data: vec![algebra.one(); size],
        }
    }

    /// A tensor filled with a constant raw value.
    pub fn full(algebra: Algebra, dims: Vec<usize>, value: f64) -> Self {
        let size = dims.iter().product();
        Self {
            algebra,
            dims,
            data: vec![value; size],
        }
    }

    /// A scalar (rank-0) tensor.
    pub fn scalar(algebra: Algebra, value: f64) -> Self {
        Self {
            algebra,
            dims: vec![],
            data: vec![value],
        }
    }

    /// A rank-1 tensor from raw values.
    pub fn vector(algebra: Algebra, data: Vec<f64>) -> Self {
        let len = data.len();
        Self {
            algebra,
            dims: vec![len],
            data,
        }
    }

    /// A tensor from raw values with an explicit shape.
    pub fn from_data(algebra: Algebra, dims: Vec<usize>, data: Vec<f64>) -> Self {
        let expected: usize = dims.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "data length {} does not match shape {:?}",
            data.len(),
            dims
        );
        Self {
            algebra,
            dims,
            data,
        }
    }

    /// A rank-1 tensor of the real values encoded into `algebra`.
    pub fn from_reals(algebra: Algebra, reals: &[f64]) -> Self {
        Self::vector(algebra, reals.iter().map(|&r| algebra.from_real(r)).collect())
    }

    #[inline]
    pub fn algebra(&self) -> Algebra {
        self.algebra
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    /// The single raw value of a scalar tensor.
    pub fn as_scalar(&self) -> f64 {
        assert!(self.is_scalar(), "as_scalar on shape {:?}", self.dims);
        self.data[0]
    }

    /// Row-major flat offset of a multi-index.
    #[inline]
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.dims.len());
        let mut off = 0;
        for (i, &ix) in index.iter().enumerate() {
            debug_assert!(ix < self.dims[i]);
            off = off * self.dims[i] + ix;
        }
        off
    }

    #[inline]
    pub fn get(&self, index: &[usize]) -> f64 {
        self.data[self.offset(index)]
    }

    #[inline]
    pub fn set(&mut self, index: &[usize], value: f64) {
        let off = self.offset(index);
        self.data[off] = value;
    }

    #[inline]
    pub fn get_flat(&self, offset: usize) -> f64 {
        self.data[offset]
    }

    #[inline]
    pub fn set_flat(&mut self, offset: usize, value: f64) {
        self.data[offset] = value;
    }

    fn zip_with(&self, other: &Tensor, f: impl Fn(Algebra, f64, f64) -> f64) -> Tensor {
        assert_eq!(
            self.algebra, other.algebra,
            "algebra mismatch: {:?} vs {:?}",
            self.algebra, other.algebra
        );
        // Scalars broadcast against any shape.
        if other.is_scalar() && !self.is_scalar() {
            let b = other.data[0];
            return Tensor {
                algebra: self.algebra,
                dims: self.dims.clone(),
                data: self.data.iter().map(|&a| f(self.algebra, a, b)).collect(),
            };
        }
        if self.is_scalar() && !other.is_scalar() {
            let a = self.data[0];
            return Tensor {
                algebra: self.algebra,
                dims: other.dims.clone(),
                data: other.data.iter().map(|&b| f(self.algebra, a, b)).collect(),
            };
        }
        assert_eq!(
            self.dims, other.dims,
            "shape mismatch: {:?} vs {:?}",
            self.dims, other.dims
        );
        Tensor {
            algebra: self.algebra,
            dims: self.dims.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(self.algebra, a, b))
                .collect(),
        }
    }

    /// Elementwise semiring addition (scalars broadcast).
    pub fn plus(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |alg, a, b| alg.plus(a, b))
    }

    /// Elementwise subtraction (scalars broadcast).
    pub fn minus(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |alg, a, b| alg.minus(a, b))
    }

    /// Elementwise semiring multiplication (scalars broadcast).
    pub fn times(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |alg, a, b| alg.times(a, b))
    }

    /// Elementwise division (scalars broadcast). Zero numerators yield
    /// zero; see [`Algebra::divide`].
    pub fn divide(&self, other: &Tensor) -> Tensor {
        self.zip_with(other, |alg, a, b| alg.divide(a, b))
    }

    /// Apply a raw-value function elementwise.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor {
            algebra: self.algebra,
            dims: self.dims.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Semiring sum of all entries.
    pub fn sum(&self) -> f64 {
        self.data
            .iter()
            .fold(self.algebra.zero(), |acc, &v| self.algebra.plus(acc, v))
    }

    /// Semiring product of all entries.
    pub fn product(&self) -> f64 {
        self.data
            .iter()
            .fold(self.algebra.one(), |acc, &v| self.algebra.times(acc, v))
    }

    /// Divide every entry by the semiring sum so the tensor sums to one.
    /// A tensor summing to the additive identity is left unchanged (there
    /// is no mass to distribute); returns the pre-normalization sum.
    pub fn normalize(&mut self) -> f64 {
        let s = self.sum();
        if !self.algebra.is_zero(s) {
            for v in &mut self.data {
                *v = self.algebra.divide(*v, s);
            }
        }
        s
    }

    /// Re-encode every entry into `target`.
    pub fn to_algebra(&self, target: Algebra) -> Tensor {
        if self.algebra == target {
            return self.clone();
        }
        Tensor {
            algebra: target,
            dims: self.dims.clone(),
            data: self
                .data
                .iter()
                .map(|&v| self.algebra.convert(v, target))
                .collect(),
        }
    }

    /// The real numbers this tensor represents.
    pub fn to_reals(&self) -> Vec<f64> {
        self.data.iter().map(|&v| self.algebra.to_real(v)).collect()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor({:?}, {:?}, {:?})",
            self.algebra,
            self.dims,
            self.to_reals()
        )
    }
}
