//! Dense row-major matrices for the small policy networks.
//!
//! Layers are stored as `(out, in)` so a forward pass is `W · x`.

use serde::{Deserialize, Serialize};

use crate::core::AgentRng;

/// A dense `rows x cols` matrix of `f64`, row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from row-major data. Returns `None` if the length does not match.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    /// Build element-wise from `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    /// Zero-mean Gaussian weights with std `1/sqrt(cols)` (Xavier-style).
    pub fn xavier(rows: usize, cols: usize, rng: &mut AgentRng) -> Self {
        let std = 1.0 / (cols.max(1) as f64).sqrt();
        Self::from_fn(rows, cols, |_, _| rng.normal(0.0, std))
    }

    /// Element-wise Gaussian draw around `mean` with per-element `std`.
    ///
    /// `mean` and `std` must share a shape.
    pub fn sample_normal(mean: &Matrix, std: &Matrix, rng: &mut AgentRng) -> Self {
        debug_assert_eq!(mean.shape(), std.shape());
        let data = mean
            .data
            .iter()
            .zip(&std.data)
            .map(|(&m, &s)| rng.normal(m, s))
            .collect();
        Self {
            rows: mean.rows,
            cols: mean.cols,
            data,
        }
    }

    /// Matrix filled with a constant.
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `[rows, cols]`, the layout used for checkpoint tensors.
    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    /// Row-major view of the elements.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consume into row-major data.
    #[must_use]
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// `W · x`.
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.cols);
        self.data
            .chunks_exact(self.cols.max(1))
            .take(self.rows)
            .map(|row| row.iter().zip(x).map(|(w, v)| w * v).sum())
            .collect()
    }

    /// `Wᵀ · v`.
    pub fn transpose_mul_vec(&self, v: &[f64]) -> Vec<f64> {
        debug_assert_eq!(v.len(), self.rows);
        let mut out = vec![0.0; self.cols];
        for (r, &scale) in v.iter().enumerate() {
            let row = &self.data[r * self.cols..(r + 1) * self.cols];
            for (o, w) in out.iter_mut().zip(row) {
                *o += w * scale;
            }
        }
        out
    }

    /// `self += scale * (a ⊗ b)` where `a` has `rows` entries and `b` has `cols`.
    pub fn add_outer(&mut self, scale: f64, a: &[f64], b: &[f64]) {
        debug_assert_eq!(a.len(), self.rows);
        debug_assert_eq!(b.len(), self.cols);
        for (r, &ar) in a.iter().enumerate() {
            let row = &mut self.data[r * self.cols..(r + 1) * self.cols];
            for (cell, &bc) in row.iter_mut().zip(b) {
                *cell += scale * ar * bc;
            }
        }
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, scale: f64, other: &Matrix) {
        debug_assert_eq!(self.shape(), other.shape());
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += scale * b;
        }
    }

    /// Reset every element to zero, keeping the shape.
    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Whether every element is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Element-wise mean of equally shaped matrices.
///
/// Returns `None` for an empty slice.
pub fn elementwise_mean(matrices: &[&Matrix]) -> Option<Matrix> {
    let first = matrices.first()?;
    let mut sum = Matrix::zeros(first.rows, first.cols);
    for m in matrices {
        sum.add_scaled(1.0, m);
    }
    let n = matrices.len() as f64;
    sum.data.iter_mut().for_each(|v| *v /= n);
    Some(sum)
}

/// Element-wise population standard deviation around `mean`.
pub fn elementwise_std(matrices: &[&Matrix], mean: &Matrix) -> Matrix {
    let mut acc = Matrix::zeros(mean.rows, mean.cols);
    for m in matrices {
        for ((a, &x), &mu) in acc.data.iter_mut().zip(&m.data).zip(&mean.data) {
            *a += (x - mu) * (x - mu);
        }
    }
    let n = matrices.len().max(1) as f64;
    acc.data.iter_mut().for_each(|v| *v = (*v / n).sqrt());
    acc
}
