//! Gaussian mixture per class with BIC model selection.
//!
//! Each candidate component count is fitted by expectation-maximisation with
//! full covariances, initialised from a seeded k-means++ clustering. The
//! candidate with the lowest BIC wins; ties keep the earlier candidate.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::gaussian::MultivariateGaussian;
use super::linalg::{logsumexp, weighted_covariance};
use super::snapshot::{matrix_to_rows, rows_to_matrix, DistributionRecord};
use super::store::DistributionFitter;
use super::RehearsalKind;
use crate::{ClassId, RehearsalError, Result};

/// Keeps empty components from dividing by zero in the M-step.
const RESP_FLOOR: f64 = 10.0 * f64::EPSILON;

/// Expectation-maximisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    /// Maximum EM iterations per candidate.
    pub max_iter: usize,
    /// Convergence threshold on the change of mean log-likelihood.
    pub tol: f64,
    /// Added to every covariance diagonal.
    pub reg_covar: f64,
    /// Lloyd iterations after k-means++ seeding.
    pub kmeans_iter: usize,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
            kmeans_iter: 10,
        }
    }
}

/// A fitted Gaussian mixture.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    /// Mixing weights, summing to one.
    pub weights: Array1<f64>,
    /// One Gaussian per component.
    pub components: Vec<MultivariateGaussian>,
    /// BIC on the data the mixture was fitted to.
    pub bic: f64,
    /// EM iterations used.
    pub n_iter: usize,
}

impl GaussianMixture {
    /// Number of mixture components.
    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Feature dimension.
    pub fn dim(&self) -> usize {
        self.components.first().map(|c| c.dim()).unwrap_or(0)
    }

    /// Free parameters: covariances, means and `k - 1` weights.
    pub fn num_parameters(&self) -> usize {
        num_parameters(self.n_components(), self.dim())
    }

    /// `ln wₖ + ln N(xᵢ | μₖ, Σₖ)` for every row and component.
    fn weighted_log_prob(&self, samples: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((samples.nrows(), self.n_components()));
        for (k, component) in self.components.iter().enumerate() {
            let log_w = self.weights[k].ln();
            let log_pdf = component.log_pdf_rows(samples);
            out.column_mut(k).assign(&(log_pdf + log_w));
        }
        out
    }

    /// Per-row log-likelihood and log responsibilities.
    fn estimate_log_resp(&self, samples: ArrayView2<f64>) -> (Array1<f64>, Array2<f64>) {
        let mut log_resp = self.weighted_log_prob(samples);
        let log_norm: Array1<f64> = log_resp
            .axis_iter(Axis(0))
            .map(|row| logsumexp(&row.to_vec()))
            .collect();
        log_resp -= &log_norm.view().insert_axis(Axis(1));
        (log_norm, log_resp)
    }

    /// Mean per-row log-likelihood.
    pub fn score(&self, samples: ArrayView2<f64>) -> f64 {
        let (log_norm, _) = self.estimate_log_resp(samples);
        log_norm.mean().unwrap_or(f64::NEG_INFINITY)
    }

    /// `-2 ln L + p ln n`.
    pub fn bic_on(&self, samples: ArrayView2<f64>) -> f64 {
        let n = samples.nrows() as f64;
        -2.0 * self.score(samples) * n + self.num_parameters() as f64 * n.ln()
    }

    /// Draw `n` rows, choosing a component per draw by its weight.
    pub fn sample(&self, n: usize, rng: &mut StdRng) -> std::result::Result<Array2<f64>, String> {
        let picker = WeightedIndex::new(self.weights.iter()).map_err(|e| e.to_string())?;
        let mut samples = Array2::zeros((n, self.dim()));
        for mut row in samples.axis_iter_mut(Axis(0)) {
            let k = picker.sample(rng);
            row.assign(&self.components[k].sample_one(rng));
        }
        Ok(samples)
    }
}

fn num_parameters(k: usize, d: usize) -> usize {
    k * d * (d + 1) / 2 + k * d + k - 1
}

/// Fits a [`GaussianMixture`] per class, choosing the component count by BIC.
#[derive(Debug, Clone)]
pub struct MixtureFitter {
    components_range: Vec<usize>,
    seed: Option<u64>,
    em: EmConfig,
}

impl MixtureFitter {
    /// Create a fitter over the candidate component counts.
    pub fn new(components_range: Vec<usize>, seed: Option<u64>, em: EmConfig) -> Self {
        Self {
            components_range,
            seed,
            em,
        }
    }

    /// Candidate component counts in evaluation order.
    pub fn components_range(&self) -> &[usize] {
        &self.components_range
    }

    /// Fit a mixture with exactly `k` components.
    pub fn fit_candidate(
        &self,
        samples: ArrayView2<f64>,
        k: usize,
        rng: &mut StdRng,
    ) -> std::result::Result<GaussianMixture, String> {
        let (n, d) = samples.dim();
        if k == 0 {
            return Err("component count must be at least 1".to_string());
        }
        if n < k {
            return Err(format!("{} rows cannot support {} components", n, k));
        }
        if d == 0 {
            return Err("features have zero dimensions".to_string());
        }

        let labels = kmeans_labels(samples, k, self.em.kmeans_iter, rng);
        let mut resp = Array2::<f64>::zeros((n, k));
        for (i, &label) in labels.iter().enumerate() {
            resp[[i, label]] = 1.0;
        }
        let mut mixture = self.m_step(samples, &resp)?;

        let mut lower_bound = f64::NEG_INFINITY;
        let mut converged = false;
        let mut n_iter = 0;

        for iter in 1..=self.em.max_iter {
            n_iter = iter;
            let prev = lower_bound;

            let (log_norm, log_resp) = mixture.estimate_log_resp(samples);
            lower_bound = log_norm.mean().unwrap_or(f64::NAN);
            if !lower_bound.is_finite() {
                return Err(format!("log-likelihood became non-finite at iteration {}", iter));
            }

            resp = log_resp.mapv(f64::exp);
            mixture = self.m_step(samples, &resp)?;

            if (lower_bound - prev).abs() < self.em.tol {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(format!("did not converge within {} iterations", self.em.max_iter));
        }

        mixture.n_iter = n_iter;
        mixture.bic = mixture.bic_on(samples);
        if !mixture.bic.is_finite() {
            return Err("BIC is not finite".to_string());
        }
        Ok(mixture)
    }

    /// Re-estimate weights, means and covariances from responsibilities.
    fn m_step(
        &self,
        samples: ArrayView2<f64>,
        resp: &Array2<f64>,
    ) -> std::result::Result<GaussianMixture, String> {
        let n = samples.nrows() as f64;
        let d = samples.ncols();
        let nk = resp.sum_axis(Axis(0)) + RESP_FLOOR;

        let mut weights = &nk / n;
        let total = weights.sum();
        weights /= total;

        let mut components = Vec::with_capacity(nk.len());
        for (k, &count) in nk.iter().enumerate() {
            let r = resp.column(k);
            let mean = r.dot(&samples) / count;
            let mut covariance = weighted_covariance(samples, r, &mean, count);
            for i in 0..d {
                covariance[[i, i]] += self.em.reg_covar;
            }
            let component = MultivariateGaussian::new(mean, covariance)
                .map_err(|e| format!("component {} covariance: {}", k, e))?;
            components.push(component);
        }

        Ok(GaussianMixture {
            weights,
            components,
            bic: f64::NAN,
            n_iter: 0,
        })
    }

    fn candidate_rng(&self, rng: &mut StdRng) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rng.gen()),
        }
    }
}

impl DistributionFitter for MixtureFitter {
    type Model = GaussianMixture;

    fn kind(&self) -> RehearsalKind {
        RehearsalKind::GaussianMixtureModel
    }

    fn fit(
        &self,
        class_id: ClassId,
        features: ArrayView2<f64>,
        rng: &mut StdRng,
    ) -> Result<GaussianMixture> {
        if features.iter().any(|v| !v.is_finite()) {
            return Err(RehearsalError::Fit {
                class_id,
                reason: "features contain non-finite values".to_string(),
            });
        }

        let mut best: Option<GaussianMixture> = None;
        let mut failures = Vec::new();

        for &k in &self.components_range {
            let mut candidate_rng = self.candidate_rng(rng);
            match self.fit_candidate(features, k, &mut candidate_rng) {
                Ok(mixture) => {
                    tracing::debug!(
                        "class {}: k={} bic={:.4} after {} iterations",
                        class_id,
                        k,
                        mixture.bic,
                        mixture.n_iter
                    );
                    let better = best.as_ref().map_or(true, |b| mixture.bic < b.bic);
                    if better {
                        best = Some(mixture);
                    }
                }
                Err(reason) => {
                    tracing::debug!("class {}: k={} excluded: {}", class_id, k, reason);
                    failures.push(format!("k={}: {}", k, reason));
                }
            }
        }

        best.ok_or_else(|| RehearsalError::Fit {
            class_id,
            reason: if failures.is_empty() {
                "no component candidates configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }

    fn sample(&self, model: &GaussianMixture, n: usize, rng: &mut StdRng) -> Result<Array2<f64>> {
        model
            .sample(n, rng)
            .map_err(|e| RehearsalError::Data(format!("invalid mixture weights: {}", e)))
    }

    fn dim(&self, model: &GaussianMixture) -> usize {
        model.dim()
    }

    fn to_record(&self, model: &GaussianMixture) -> DistributionRecord {
        DistributionRecord::Mixture {
            n_components: model.n_components(),
            weights: model.weights.to_vec(),
            means: model.components.iter().map(|c| c.mean.to_vec()).collect(),
            covariances: model
                .components
                .iter()
                .map(|c| matrix_to_rows(&c.covariance))
                .collect(),
            bic: model.bic,
            n_iter: model.n_iter,
        }
    }

    fn from_record(&self, class_id: ClassId, record: &DistributionRecord) -> Result<GaussianMixture> {
        let (n_components, weights, means, covariances, bic, n_iter) = match record {
            DistributionRecord::Mixture {
                n_components,
                weights,
                means,
                covariances,
                bic,
                n_iter,
            } => (*n_components, weights, means, covariances, *bic, *n_iter),
            other => {
                return Err(RehearsalError::SnapshotMismatch(format!(
                    "class {}: expected a mixture record, found {}",
                    class_id,
                    other.type_name()
                )))
            }
        };

        if weights.len() != n_components
            || means.len() != n_components
            || covariances.len() != n_components
            || n_components == 0
        {
            return Err(RehearsalError::SnapshotMismatch(format!(
                "class {}: mixture record lists {} components but holds {} weights, {} means, {} covariances",
                class_id,
                n_components,
                weights.len(),
                means.len(),
                covariances.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(RehearsalError::SnapshotMismatch(format!(
                "class {}: mixture weights must be finite and non-negative",
                class_id
            )));
        }

        let dim = means[0].len();
        let mut components = Vec::with_capacity(n_components);
        for (mean, covariance) in means.iter().zip(covariances) {
            let covariance = rows_to_matrix(covariance)?;
            if mean.len() != dim || covariance.dim() != (dim, dim) {
                return Err(RehearsalError::SnapshotMismatch(format!(
                    "class {}: inconsistent component dimensions",
                    class_id
                )));
            }
            let component = MultivariateGaussian::new(Array1::from_vec(mean.clone()), covariance)
                .map_err(|e| RehearsalError::DegenerateDistribution {
                    class_id,
                    reason: e.to_string(),
                })?;
            components.push(component);
        }

        Ok(GaussianMixture {
            weights: Array1::from_vec(weights.clone()),
            components,
            bic,
            n_iter,
        })
    }
}

/// Hard cluster labels from k-means++ seeding followed by Lloyd iterations.
fn kmeans_labels(samples: ArrayView2<f64>, k: usize, iters: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = samples.nrows();
    let sq_dist = |i: usize, center: &Array1<f64>| -> f64 {
        samples
            .row(i)
            .iter()
            .zip(center.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum()
    };

    let mut centers: Vec<Array1<f64>> = Vec::with_capacity(k);
    centers.push(samples.row(rng.gen_range(0..n)).to_owned());
    let mut closest: Vec<f64> = (0..n).map(|i| sq_dist(i, &centers[0])).collect();

    while centers.len() < k {
        let next = match WeightedIndex::new(&closest) {
            Ok(dist) => dist.sample(rng),
            // All remaining points coincide with a centre
            Err(_) => rng.gen_range(0..n),
        };
        centers.push(samples.row(next).to_owned());
        let newest = centers.len() - 1;
        for (i, c) in closest.iter_mut().enumerate() {
            *c = c.min(sq_dist(i, &centers[newest]));
        }
    }

    let assign = |centers: &[Array1<f64>]| -> Vec<usize> {
        (0..n)
            .map(|i| {
                let mut best = 0;
                let mut best_dist = f64::MAX;
                for (j, center) in centers.iter().enumerate() {
                    let dist = sq_dist(i, center);
                    if dist < best_dist {
                        best_dist = dist;
                        best = j;
                    }
                }
                best
            })
            .collect()
    };

    let mut labels = assign(&centers);
    for _ in 0..iters {
        for (j, center) in centers.iter_mut().enumerate() {
            let members: Vec<usize> = (0..n).filter(|&i| labels[i] == j).collect();
            if let Some(mean) = samples.select(Axis(0), &members).mean_axis(Axis(0)) {
                *center = mean;
            }
        }

        let updated = assign(&centers);
        if updated == labels {
            break;
        }
        labels = updated;
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::StandardNormal;

    /// Two well separated 2-D clusters of `per_cluster` rows each.
    fn two_clusters(per_cluster: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((2 * per_cluster, 2), |(i, _)| {
            let offset = if i < per_cluster { -6.0 } else { 6.0 };
            offset + rng.sample::<f64, _>(StandardNormal) * 0.5
        })
    }

    fn fitter(range: Vec<usize>) -> MixtureFitter {
        MixtureFitter::new(range, Some(7), EmConfig::default())
    }

    #[test]
    fn test_num_parameters() {
        // 2 components in 3-D: 2*6 cov + 2*3 means + 1 weight
        assert_eq!(num_parameters(2, 3), 19);
        assert_eq!(num_parameters(1, 1), 2);
    }

    #[test]
    fn test_candidate_weights_and_means() {
        let x = two_clusters(100, 1);
        let mut rng = StdRng::seed_from_u64(3);
        let gmm = fitter(vec![2]).fit_candidate(x.view(), 2, &mut rng).unwrap();

        assert_eq!(gmm.n_components(), 2);
        assert!((gmm.weights.sum() - 1.0).abs() < 1e-9);
        for w in gmm.weights.iter() {
            assert!((w - 0.5).abs() < 0.05);
        }
        let mut centers: Vec<f64> = gmm.components.iter().map(|c| c.mean[0]).collect();
        centers.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((centers[0] + 6.0).abs() < 0.3);
        assert!((centers[1] - 6.0).abs() < 0.3);
    }

    #[test]
    fn test_single_candidate_always_selected() {
        let x = two_clusters(50, 2);
        let mut rng = StdRng::seed_from_u64(0);
        // One component is a poor fit for two clusters but is the only option
        let gmm = fitter(vec![1]).fit(0, x.view(), &mut rng).unwrap();
        assert_eq!(gmm.n_components(), 1);

        let gmm = fitter(vec![4]).fit(0, x.view(), &mut rng).unwrap();
        assert_eq!(gmm.n_components(), 4);
    }

    #[test]
    fn test_selects_lowest_bic() {
        let x = two_clusters(100, 5);
        let f = fitter(vec![2, 3, 4]);
        let mut rng = StdRng::seed_from_u64(0);
        let chosen = f.fit(0, x.view(), &mut rng).unwrap();

        let mut best_bic = f64::INFINITY;
        for k in [2, 3, 4] {
            let mut candidate_rng = StdRng::seed_from_u64(7);
            if let Ok(m) = f.fit_candidate(x.view(), k, &mut candidate_rng) {
                best_bic = best_bic.min(m.bic);
            }
        }
        assert_eq!(chosen.bic, best_bic);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let x = two_clusters(80, 9);
        let f = fitter(vec![2, 3, 4]);
        let a = f.fit(3, x.view(), &mut StdRng::seed_from_u64(1)).unwrap();
        let b = f.fit(3, x.view(), &mut StdRng::seed_from_u64(99)).unwrap();

        assert_eq!(a.n_components(), b.n_components());
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.bic, b.bic);
        for (ca, cb) in a.components.iter().zip(&b.components) {
            assert_eq!(ca.mean, cb.mean);
            assert_eq!(ca.covariance, cb.covariance);
        }
    }

    #[test]
    fn test_all_candidates_fail() {
        // Three rows cannot support 4 or 5 components
        let x = Array2::from_shape_fn((3, 2), |(i, j)| (i + j) as f64);
        let mut rng = StdRng::seed_from_u64(0);
        let err = fitter(vec![4, 5]).fit(9, x.view(), &mut rng).unwrap_err();
        match err {
            RehearsalError::Fit { class_id, reason } => {
                assert_eq!(class_id, 9);
                assert!(reason.contains("k=4"));
                assert!(reason.contains("k=5"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_failed_candidate_is_excluded() {
        let x = two_clusters(3, 4);
        let mut rng = StdRng::seed_from_u64(0);
        // k=10 exceeds the 6 rows and is skipped, k=2 survives
        let gmm = fitter(vec![10, 2]).fit(0, x.view(), &mut rng).unwrap();
        assert_eq!(gmm.n_components(), 2);
    }

    #[test]
    fn test_sample_shape_and_spread() {
        let x = two_clusters(100, 6);
        let mut rng = StdRng::seed_from_u64(0);
        let gmm = fitter(vec![2]).fit(0, x.view(), &mut rng).unwrap();

        let samples = gmm.sample(2_000, &mut rng).unwrap();
        assert_eq!(samples.dim(), (2_000, 2));
        let left = samples.column(0).iter().filter(|v| **v < 0.0).count();
        assert!(left > 800 && left < 1_200);
    }

    #[test]
    fn test_record_round_trip() {
        let x = two_clusters(40, 8);
        let f = fitter(vec![2, 3]);
        let mut rng = StdRng::seed_from_u64(0);
        let gmm = f.fit(0, x.view(), &mut rng).unwrap();

        let restored = f.from_record(0, &f.to_record(&gmm)).unwrap();
        assert_eq!(restored.n_components(), gmm.n_components());
        assert_eq!(restored.weights, gmm.weights);
        assert_eq!(restored.bic, gmm.bic);
        for (a, b) in restored.components.iter().zip(&gmm.components) {
            assert_eq!(a.mean, b.mean);
            assert_eq!(a.covariance, b.covariance);
        }
    }
}
