//! Single multivariate Gaussian per class.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use super::linalg::{
    cholesky, log_det_from_cholesky, sample_covariance, sample_mean, solve_lower,
    NotPositiveDefinite,
};
use super::snapshot::{matrix_to_rows, rows_to_matrix, DistributionRecord};
use super::store::DistributionFitter;
use super::RehearsalKind;
use crate::{ClassId, RehearsalError, Result};

/// Multivariate normal distribution with a cached Cholesky factor.
#[derive(Debug, Clone)]
pub struct MultivariateGaussian {
    /// Mean vector
    pub mean: Array1<f64>,
    /// Covariance matrix
    pub covariance: Array2<f64>,
    cholesky: Array2<f64>,
    log_det: f64,
}

impl MultivariateGaussian {
    /// Create a Gaussian, failing if the covariance is not positive definite.
    pub fn new(
        mean: Array1<f64>,
        covariance: Array2<f64>,
    ) -> std::result::Result<Self, NotPositiveDefinite> {
        let cholesky = cholesky(&covariance)?;
        let log_det = log_det_from_cholesky(&cholesky);
        Ok(Self {
            mean,
            covariance,
            cholesky,
            log_det,
        })
    }

    /// Dimension of the distribution
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Lower Cholesky factor of the covariance.
    pub fn cholesky_factor(&self) -> &Array2<f64> {
        &self.cholesky
    }

    /// Log density at a single point.
    pub fn log_pdf(&self, x: ArrayView1<f64>) -> f64 {
        let diff = &x - &self.mean;
        let z = solve_lower(&self.cholesky, diff.view());
        let quad_form = z.dot(&z);
        -0.5 * (self.dim() as f64 * (2.0 * PI).ln() + self.log_det + quad_form)
    }

    /// Log density of every row of `samples`.
    pub fn log_pdf_rows(&self, samples: ArrayView2<f64>) -> Array1<f64> {
        samples
            .axis_iter(Axis(0))
            .map(|row| self.log_pdf(row))
            .collect()
    }

    /// Draw a single point.
    pub fn sample_one(&self, rng: &mut StdRng) -> Array1<f64> {
        let z = Array1::from_shape_fn(self.dim(), |_| rng.sample::<f64, _>(StandardNormal));
        &self.mean + &self.cholesky.dot(&z)
    }

    /// Draw `n` rows: `x = μ + L z` with `z ~ N(0, I)`.
    pub fn sample(&self, n: usize, rng: &mut StdRng) -> Array2<f64> {
        let d = self.dim();
        let z = Array2::from_shape_fn((n, d), |_| rng.sample::<f64, _>(StandardNormal));
        let mut samples = z.dot(&self.cholesky.t());
        samples += &self.mean.view().insert_axis(Axis(0));
        samples
    }
}

/// Fits one Gaussian per class from its sample mean and covariance.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianFitter;

impl GaussianFitter {
    pub fn new() -> Self {
        Self
    }
}

impl DistributionFitter for GaussianFitter {
    type Model = MultivariateGaussian;

    fn kind(&self) -> RehearsalKind {
        RehearsalKind::GaussianDistribution
    }

    fn fit(
        &self,
        class_id: ClassId,
        features: ArrayView2<f64>,
        _rng: &mut StdRng,
    ) -> Result<MultivariateGaussian> {
        let (n, d) = features.dim();
        let degenerate = |reason: String| RehearsalError::DegenerateDistribution { class_id, reason };

        if features.iter().any(|v| !v.is_finite()) {
            return Err(degenerate("features contain non-finite values".to_string()));
        }
        if n <= d || n < 2 {
            return Err(degenerate(format!(
                "{} rows cannot give a full-rank covariance in {} dimensions",
                n, d
            )));
        }

        let mean = sample_mean(features);
        let covariance = sample_covariance(features, &mean);
        MultivariateGaussian::new(mean, covariance).map_err(|e| degenerate(e.to_string()))
    }

    fn sample(
        &self,
        model: &MultivariateGaussian,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Array2<f64>> {
        Ok(model.sample(n, rng))
    }

    fn dim(&self, model: &MultivariateGaussian) -> usize {
        model.dim()
    }

    fn to_record(&self, model: &MultivariateGaussian) -> DistributionRecord {
        DistributionRecord::Gaussian {
            mean: model.mean.to_vec(),
            covariance: matrix_to_rows(&model.covariance),
        }
    }

    fn from_record(
        &self,
        class_id: ClassId,
        record: &DistributionRecord,
    ) -> Result<MultivariateGaussian> {
        match record {
            DistributionRecord::Gaussian { mean, covariance } => {
                let mean = Array1::from_vec(mean.clone());
                let covariance = rows_to_matrix(covariance)?;
                if covariance.dim() != (mean.len(), mean.len()) {
                    return Err(RehearsalError::SnapshotMismatch(format!(
                        "class {}: covariance shape {:?} does not match mean length {}",
                        class_id,
                        covariance.dim(),
                        mean.len()
                    )));
                }
                MultivariateGaussian::new(mean, covariance).map_err(|e| {
                    RehearsalError::DegenerateDistribution {
                        class_id,
                        reason: e.to_string(),
                    }
                })
            }
            other => Err(RehearsalError::SnapshotMismatch(format!(
                "class {}: expected a gaussian record, found {}",
                class_id,
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;

    #[test]
    fn test_log_pdf_standard_normal() {
        let g = MultivariateGaussian::new(arr1(&[0.0, 0.0]), Array2::eye(2)).unwrap();
        let expected = -(2.0 * PI).ln();
        assert_abs_diff_eq!(g.log_pdf(arr1(&[0.0, 0.0]).view()), expected, epsilon = 1e-12);
        assert!(g.log_pdf(arr1(&[0.0, 0.0]).view()) > g.log_pdf(arr1(&[1.0, 1.0]).view()));
    }

    #[test]
    fn test_sample_statistics() {
        let mean = arr1(&[1.0, -2.0]);
        let cov = arr2(&[[2.0, 0.6], [0.6, 1.0]]);
        let g = MultivariateGaussian::new(mean.clone(), cov.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        let samples = g.sample(20_000, &mut rng);
        assert_eq!(samples.dim(), (20_000, 2));

        let m = sample_mean(samples.view());
        assert_abs_diff_eq!(m[0], 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(m[1], -2.0, epsilon = 0.05);

        let c = sample_covariance(samples.view(), &m);
        assert_abs_diff_eq!(c[[0, 0]], 2.0, epsilon = 0.1);
        assert_abs_diff_eq!(c[[0, 1]], 0.6, epsilon = 0.1);
    }

    #[test]
    fn test_fit_matches_sample_moments() {
        let x = arr2(&[[1.0, 2.0], [3.0, 6.0], [5.0, 7.0], [3.0, 5.0]]);
        let mut rng = StdRng::seed_from_u64(0);
        let g = GaussianFitter.fit(4, x.view(), &mut rng).unwrap();
        let mean = sample_mean(x.view());
        assert_eq!(g.mean, mean);
        assert_eq!(g.covariance, sample_covariance(x.view(), &mean));
    }

    #[test]
    fn test_fit_too_few_rows_is_degenerate() {
        // 3 rows in 4 dimensions
        let x = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f64 * 0.3 + (j as f64).sin());
        let mut rng = StdRng::seed_from_u64(0);
        let err = GaussianFitter.fit(7, x.view(), &mut rng).unwrap_err();
        assert!(matches!(
            err,
            RehearsalError::DegenerateDistribution { class_id: 7, .. }
        ));
    }

    #[test]
    fn test_fit_collinear_is_degenerate() {
        // Second feature is an exact copy of the first
        let x = arr2(&[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [5.0, 5.0], [8.0, 8.0]]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            GaussianFitter.fit(1, x.view(), &mut rng),
            Err(RehearsalError::DegenerateDistribution { class_id: 1, .. })
        ));
    }

    #[test]
    fn test_record_round_trip_is_exact() {
        let x = arr2(&[[0.1, 0.7], [0.3, 0.2], [0.9, 0.4], [0.5, 0.55]]);
        let mut rng = StdRng::seed_from_u64(0);
        let g = GaussianFitter.fit(0, x.view(), &mut rng).unwrap();

        let record = GaussianFitter.to_record(&g);
        let restored = GaussianFitter.from_record(0, &record).unwrap();
        assert_eq!(restored.mean, g.mean);
        assert_eq!(restored.covariance, g.covariance);
    }
}
