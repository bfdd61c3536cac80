//! Dense linear algebra needed by the density models.
//!
//! Matrices here are small (feature dimension squared), so plain loops over
//! `ndarray` storage are used instead of a LAPACK binding.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;

/// Pivot threshold, relative to the pivot's own diagonal entry, below which a
/// matrix is treated as singular.
pub const SINGULAR_TOL: f64 = 1e-10;

/// Cholesky factorisation failed because the matrix is not positive definite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotPositiveDefinite {
    /// Row at which the factorisation broke down.
    pub pivot: usize,
    /// Value of the offending pivot before the square root.
    pub value: f64,
}

impl fmt::Display for NotPositiveDefinite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matrix is not positive definite (pivot {} = {:.3e})",
            self.pivot, self.value
        )
    }
}

/// Lower-triangular `L` with `a = L Lᵀ`.
///
/// A pivot is rejected when it is non-finite, not positive, or not larger than
/// `SINGULAR_TOL` times its own diagonal entry. The test is per row, so
/// features on very different scales do not make a full-rank matrix look
/// singular, while a row that is a linear combination of earlier rows fails.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>, NotPositiveDefinite> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }

            if i == j {
                let diag = a[[i, i]] - sum;
                let floor = SINGULAR_TOL * a[[i, i]].abs();
                if !diag.is_finite() || diag <= 0.0 || diag <= floor {
                    return Err(NotPositiveDefinite { pivot: i, value: diag });
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    Ok(l)
}

/// `ln det(L Lᵀ)` from a Cholesky factor.
pub fn log_det_from_cholesky(l: &Array2<f64>) -> f64 {
    2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>()
}

/// Solve `L z = b` by forward substitution.
pub fn solve_lower(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * z[j];
        }
        z[i] = (b[i] - sum) / l[[i, i]];
    }
    z
}

/// `ln Σ exp(vᵢ)` without overflow. Returns `-inf` for an empty slice.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Column means of `samples` (rows are observations).
pub fn sample_mean(samples: ArrayView2<f64>) -> Array1<f64> {
    samples
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(samples.ncols()))
}

/// Unbiased sample covariance (divides by `n - 1`), features as columns.
pub fn sample_covariance(samples: ArrayView2<f64>, mean: &Array1<f64>) -> Array2<f64> {
    let n = samples.nrows();
    let centered = &samples - &mean.view().insert_axis(Axis(0));
    let denom = (n.saturating_sub(1)).max(1) as f64;
    centered.t().dot(&centered) / denom
}

/// Weighted covariance `Σ wᵢ (xᵢ - μ)(xᵢ - μ)ᵀ / Σ wᵢ`.
pub fn weighted_covariance(
    samples: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    mean: &Array1<f64>,
    weight_sum: f64,
) -> Array2<f64> {
    let centered = &samples - &mean.view().insert_axis(Axis(0));
    let weighted = &centered * &weights.insert_axis(Axis(1));
    weighted.t().dot(&centered) / weight_sum
}
