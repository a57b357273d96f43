//! Full-covariance Gaussian mixture fitted with EM.
//!
//! Used on the reduced embeddings only, so dimensions stay small. Responsibilities
//! start from a seeded k-means labelling (farthest-point seeding, then Lloyd
//! iterations), which keeps the fit deterministic for identical input. Each
//! component keeps the Cholesky factor of its covariance for the log-density.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{RaptorError, RaptorResult};

const LN_2PI: f64 = 1.837_877_066_409_345_5;
const KMEANS_ITERATIONS: usize = 20;

#[derive(Debug, Clone)]
pub struct GaussianMixture {
    n_components: usize,
    max_iter: usize,
    tol: f64,
    reg_covar: f64,
    seed: u64,
}

#[derive(Debug, Clone)]
struct Component {
    mean: Array1<f64>,
    /// Lower-triangular `L` with `L·Lᵀ = Σ`.
    chol: Array2<f64>,
    /// `Σ ln L_ii`, i.e. half the log-determinant of the covariance.
    half_log_det: f64,
}

impl Component {
    fn new(mean: Array1<f64>, covariance: &Array2<f64>, index: usize) -> RaptorResult<Self> {
        let chol = cholesky(covariance).ok_or_else(|| {
            RaptorError::Clustering(format!(
                "covariance of component {index} is not positive definite"
            ))
        })?;
        let half_log_det = chol.diag().iter().map(|v| v.ln()).sum();
        Ok(Self {
            mean,
            chol,
            half_log_det,
        })
    }

    fn log_density(&self, point: ArrayView1<'_, f64>) -> f64 {
        let d = point.len();
        // Forward substitution: L·y = x - mean.
        let mut y = vec![0.0; d];
        let mut quad = 0.0;
        for i in 0..d {
            let mut v = point[i] - self.mean[i];
            for (p, yp) in y.iter().enumerate().take(i) {
                v -= self.chol[[i, p]] * yp;
            }
            y[i] = v / self.chol[[i, i]];
            quad += y[i] * y[i];
        }
        -0.5 * (d as f64 * LN_2PI + quad) - self.half_log_det
    }
}

/// Parameters of a fitted mixture plus its total log-likelihood on the training data.
#[derive(Debug, Clone)]
pub struct FittedMixture {
    weights: Array1<f64>,
    components: Vec<Component>,
    log_likelihood: f64,
    n_samples: usize,
    converged: bool,
}

impl GaussianMixture {
    pub fn new(n_components: usize, seed: u64) -> Self {
        Self {
            n_components,
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
            seed,
        }
    }

    pub fn fit(&self, data: &Array2<f64>) -> RaptorResult<FittedMixture> {
        let (n, d) = data.dim();
        let k = self.n_components;
        if n == 0 || d == 0 {
            return Err(RaptorError::Clustering("mixture fit on empty data".into()));
        }
        if k == 0 || k > n {
            return Err(RaptorError::Clustering(format!(
                "cannot fit {k} components to {n} samples"
            )));
        }

        // Components that receive no mass keep the pooled covariance.
        let pooled_mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
        let pooled = self.weighted_covariance(data, &pooled_mean, |_| 1.0, n as f64);
        let mut components = Vec::with_capacity(k);
        for c in 0..k {
            components.push(Component::new(pooled_mean.clone(), &pooled, c)?);
        }
        let mut weights = Array1::from_elem(k, 1.0 / k as f64);

        let mut resp = Array2::zeros((n, k));
        for (i, label) in kmeans_labels(data, k, self.seed).into_iter().enumerate() {
            resp[[i, label]] = 1.0;
        }
        self.m_step(data, &resp, &mut weights, &mut components)?;

        let mut prev_mean_ll = f64::NEG_INFINITY;
        let mut log_likelihood = f64::NEG_INFINITY;
        let mut converged = false;

        for _ in 0..self.max_iter {
            log_likelihood = e_step(data, &weights, &components, &mut resp);
            if !log_likelihood.is_finite() {
                return Err(RaptorError::Clustering(format!(
                    "non-finite log-likelihood with {k} components"
                )));
            }
            let mean_ll = log_likelihood / n as f64;
            if (mean_ll - prev_mean_ll).abs() < self.tol {
                converged = true;
                break;
            }
            prev_mean_ll = mean_ll;
            self.m_step(data, &resp, &mut weights, &mut components)?;
        }

        if !converged {
            // Parameters moved after the last E-step; score them once more.
            log_likelihood = e_step(data, &weights, &components, &mut resp);
            if !log_likelihood.is_finite() {
                return Err(RaptorError::Clustering(format!(
                    "non-finite log-likelihood with {k} components"
                )));
            }
        }

        Ok(FittedMixture {
            weights,
            components,
            log_likelihood,
            n_samples: n,
            converged,
        })
    }

    /// `Σ r_i (x_i - mean)(x_i - mean)ᵀ / total`, with `reg_covar` on the diagonal.
    fn weighted_covariance(
        &self,
        data: &Array2<f64>,
        mean: &Array1<f64>,
        weight: impl Fn(usize) -> f64,
        total: f64,
    ) -> Array2<f64> {
        let d = mean.len();
        let mut cov = Array2::<f64>::zeros((d, d));
        for (i, point) in data.rows().into_iter().enumerate() {
            let r = weight(i);
            if r == 0.0 {
                continue;
            }
            let diff = &point - mean;
            for a in 0..d {
                for b in 0..=a {
                    cov[[a, b]] += r * diff[a] * diff[b];
                }
            }
        }
        for a in 0..d {
            for b in 0..a {
                cov[[b, a]] = cov[[a, b]];
            }
        }
        cov /= total;
        for a in 0..d {
            cov[[a, a]] += self.reg_covar;
        }
        cov
    }

    fn m_step(
        &self,
        data: &Array2<f64>,
        resp: &Array2<f64>,
        weights: &mut Array1<f64>,
        components: &mut [Component],
    ) -> RaptorResult<()> {
        let (n, d) = data.dim();
        for (c, component) in components.iter_mut().enumerate() {
            let nk = resp.column(c).sum();
            weights[c] = (nk / n as f64).max(f64::MIN_POSITIVE);
            if nk <= 1e-10 {
                continue;
            }
            let mut mean = Array1::<f64>::zeros(d);
            for (i, point) in data.rows().into_iter().enumerate() {
                mean.scaled_add(resp[[i, c]], &point);
            }
            mean /= nk;

            let cov = self.weighted_covariance(data, &mean, |i| resp[[i, c]], nk);
            *component = Component::new(mean, &cov, c)?;
        }
        let total = weights.sum();
        *weights /= total;
        Ok(())
    }
}

/// Lower Cholesky factor of a symmetric matrix, `None` unless positive definite.
fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let d = a.nrows();
    let mut l = Array2::<f64>::zeros((d, d));
    for j in 0..d {
        let mut diag = a[[j, j]];
        for p in 0..j {
            diag -= l[[j, p]] * l[[j, p]];
        }
        if !(diag > 0.0 && diag.is_finite()) {
            return None;
        }
        let ljj = diag.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..d {
            let mut v = a[[i, j]];
            for p in 0..j {
                v -= l[[i, p]] * l[[j, p]];
            }
            l[[i, j]] = v / ljj;
        }
    }
    Some(l)
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Seeded hard labelling: one random first centre, then farthest points, then Lloyd.
fn kmeans_labels(data: &Array2<f64>, k: usize, seed: u64) -> Vec<usize> {
    let n = data.nrows();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centres: Vec<Array1<f64>> = vec![data.row(rng.random_range(0..n)).to_owned()];
    let mut nearest: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|p| squared_distance(p, centres[0].view()))
        .collect();
    while centres.len() < k {
        let far = argmax(nearest.iter().copied());
        let centre = data.row(far).to_owned();
        for (i, point) in data.rows().into_iter().enumerate() {
            nearest[i] = nearest[i].min(squared_distance(point, centre.view()));
        }
        centres.push(centre);
    }

    let mut labels = vec![0; n];
    for iteration in 0..KMEANS_ITERATIONS {
        let mut changed = false;
        for (i, point) in data.rows().into_iter().enumerate() {
            let best = argmin(centres.iter().map(|c| squared_distance(point, c.view())));
            if best != labels[i] {
                labels[i] = best;
                changed = true;
            }
        }
        if iteration > 0 && !changed {
            break;
        }
        for (c, centre) in centres.iter_mut().enumerate() {
            let members: Vec<usize> = (0..n).filter(|&i| labels[i] == c).collect();
            if members.is_empty() {
                continue;
            }
            let mut sum = Array1::<f64>::zeros(data.ncols());
            for &i in &members {
                sum += &data.row(i);
            }
            *centre = sum / members.len() as f64;
        }
    }
    labels
}

fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

fn argmin(values: impl Iterator<Item = f64>) -> usize {
    argmax(values.map(|v| -v))
}

fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Fill `resp` with posterior probabilities and return the total log-likelihood.
fn e_step(
    data: &Array2<f64>,
    weights: &Array1<f64>,
    components: &[Component],
    resp: &mut Array2<f64>,
) -> f64 {
    let k = weights.len();
    let mut total = 0.0;
    let mut log_probs = vec![0.0; k];
    for (i, point) in data.rows().into_iter().enumerate() {
        for (c, component) in components.iter().enumerate() {
            log_probs[c] = weights[c].ln() + component.log_density(point);
        }
        let norm = logsumexp(&log_probs);
        total += norm;
        for c in 0..k {
            resp[[i, c]] = (log_probs[c] - norm).exp();
        }
    }
    total
}

impl FittedMixture {
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    fn dimension(&self) -> usize {
        self.components.first().map_or(0, |c| c.mean.len())
    }

    /// Free parameters: per component a mean and a full symmetric covariance, plus k-1 weights.
    pub fn n_parameters(&self) -> usize {
        let k = self.n_components();
        let d = self.dimension();
        k * d + k * d * (d + 1) / 2 + (k - 1)
    }

    /// Bayesian information criterion on the training data; lower is better.
    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + self.n_parameters() as f64 * (self.n_samples as f64).ln()
    }

    /// Posterior component probabilities, one row per sample.
    pub fn predict_proba(&self, data: &Array2<f64>) -> RaptorResult<Array2<f64>> {
        if data.ncols() != self.dimension() {
            return Err(RaptorError::Clustering(format!(
                "expected {} dimensions, got {}",
                self.dimension(),
                data.ncols()
            )));
        }
        let mut resp = Array2::zeros((data.nrows(), self.n_components()));
        let ll = e_step(data, &self.weights, &self.components, &mut resp);
        if !ll.is_finite() {
            return Err(RaptorError::Clustering("non-finite log-likelihood in prediction".into()));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, 0.2],
            [0.2, 0.1],
            [10.0, 10.0],
            [10.1, 10.2],
            [10.2, 10.1],
        ]
    }

    /// Two parallel elongated clusters along the diagonal, offset across it.
    fn correlated_blobs(per: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut normal = move || {
            let u1: f64 = 1.0 - rng.random::<f64>();
            let u2: f64 = rng.random::<f64>();
            (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
        };
        let along = [std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
        let across = [-std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
        let mut rows = Vec::with_capacity(2 * per * 2);
        for offset in [-4.0, 4.0] {
            for _ in 0..per {
                let major = 2.0 * normal();
                let minor = 0.3 * normal() + offset;
                rows.push(major * along[0] + minor * across[0]);
                rows.push(major * along[1] + minor * across[1]);
            }
        }
        Array2::from_shape_vec((2 * per, 2), rows).unwrap()
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]];
        let l = cholesky(&a).unwrap();
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
        assert!(cholesky(&array![[1.0, 2.0], [2.0, 1.0]]).is_none());
    }

    #[test]
    fn log_density_matches_closed_form() {
        let cov = array![[2.0, 0.5], [0.5, 1.0]];
        let component = Component::new(array![1.0, -1.0], &cov, 0).unwrap();
        let x = array![2.0, 0.0];
        // det = 1.75, inverse = [[1, -0.5], [-0.5, 2]] / 1.75, diff = [1, 1].
        let quad = (1.0 - 0.5 - 0.5 + 2.0) / 1.75;
        let expected = -0.5 * (2.0 * LN_2PI + 1.75f64.ln() + quad);
        assert!((component.log_density(x.view()) - expected).abs() < 1e-12);
    }

    #[test]
    fn separates_two_blobs() {
        let fitted = GaussianMixture::new(2, 42).fit(&two_blobs()).unwrap();
        let proba = fitted.predict_proba(&two_blobs()).unwrap();
        let label = |i: usize| if proba[[i, 0]] > proba[[i, 1]] { 0 } else { 1 };
        assert_eq!(label(0), label(1));
        assert_eq!(label(1), label(2));
        assert_eq!(label(3), label(4));
        assert_ne!(label(0), label(3));
    }

    #[test]
    fn rows_sum_to_one() {
        let fitted = GaussianMixture::new(3, 7).fit(&two_blobs()).unwrap();
        let proba = fitted.predict_proba(&two_blobs()).unwrap();
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn bic_prefers_two_components_for_two_blobs() {
        let data = two_blobs();
        let one = GaussianMixture::new(1, 42).fit(&data).unwrap().bic();
        let two = GaussianMixture::new(2, 42).fit(&data).unwrap().bic();
        assert!(two < one, "bic(2)={two} bic(1)={one}");
    }

    #[test]
    fn bic_picks_two_for_correlated_elongated_clusters() {
        let data = correlated_blobs(150);
        let bics: Vec<f64> = (1..=4)
            .map(|k| GaussianMixture::new(k, 42).fit(&data).unwrap().bic())
            .collect();
        let best = argmin(bics.iter().copied()) + 1;
        assert_eq!(best, 2, "bic curve {bics:?}");
    }

    #[test]
    fn parameter_count_covers_full_covariance() {
        let fitted = GaussianMixture::new(3, 1).fit(&correlated_blobs(20)).unwrap();
        // 3 means of 2, 3 covariances of 3 free entries, 2 free weights.
        assert_eq!(fitted.n_parameters(), 6 + 9 + 2);
    }

    #[test]
    fn same_seed_same_fit() {
        let a = GaussianMixture::new(2, 3).fit(&two_blobs()).unwrap();
        let b = GaussianMixture::new(2, 3).fit(&two_blobs()).unwrap();
        assert_eq!(a.log_likelihood(), b.log_likelihood());
        assert!(a.converged());
    }

    #[test]
    fn too_many_components_is_an_error() {
        let err = GaussianMixture::new(7, 0).fit(&two_blobs()).unwrap_err();
        assert!(matches!(err, RaptorError::Clustering(_)));
    }
}
