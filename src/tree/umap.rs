//! Manifold projection in the style of UMAP.
//!
//! Builds a fuzzy k-nearest-neighbour graph over the input, symmetrises it with
//! the probabilistic union `w + wᵀ - w·wᵀ`, and lays it out in `n_components`
//! dimensions with seeded stochastic gradient descent. Single-threaded and fully
//! seeded, so identical input always gives an identical projection.

use std::collections::BTreeMap;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DistanceMetric;
use crate::errors::{RaptorError, RaptorResult};

// Curve parameters for min_dist = 0.1, spread = 1.0.
const CURVE_A: f64 = 1.576_943_460_405_378;
const CURVE_B: f64 = 0.895_060_878_123_267_6;
const NEGATIVE_SAMPLES: usize = 5;
const GRAD_CLIP: f64 = 4.0;
const INIT_RANGE: f64 = 10.0;
const SIGMA_ITERATIONS: usize = 64;
const SIGMA_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone)]
pub struct Projection {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub metric: DistanceMetric,
    pub seed: u64,
    /// Defaults to 500 for up to 10 000 samples, 200 above.
    pub n_epochs: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    head: usize,
    tail: usize,
    weight: f64,
}

impl Projection {
    pub fn fit_transform(&self, data: &[Vec<f32>]) -> RaptorResult<Array2<f64>> {
        let n = data.len();
        if n < 2 {
            return Err(RaptorError::Clustering(format!(
                "projection needs at least 2 samples, got {n}"
            )));
        }
        if self.n_components == 0 {
            return Err(RaptorError::Clustering("projection needs at least 1 component".into()));
        }
        let k = self.n_neighbors.clamp(1, n - 1);

        let edges = self.fuzzy_graph(data, k);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut embedding = Array2::from_shape_fn((n, self.n_components), |_| {
            rng.random_range(-INIT_RANGE..INIT_RANGE)
        });

        let n_epochs = self
            .n_epochs
            .unwrap_or(if n <= 10_000 { 500 } else { 200 });
        optimize_layout(&mut embedding, &edges, n_epochs, &mut rng);

        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(RaptorError::Clustering("projection produced non-finite coordinates".into()));
        }
        Ok(embedding)
    }

    fn fuzzy_graph(&self, data: &[Vec<f32>], k: usize) -> Vec<Edge> {
        let n = data.len();
        let target = (k as f64).log2().max(f64::MIN_POSITIVE);
        // Keyed (low, high) so iteration order is fixed; value is (w_low→high, w_high→low).
        let mut directed: BTreeMap<(usize, usize), (f64, f64)> = BTreeMap::new();

        for i in 0..n {
            let mut distances: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (distance(self.metric, &data[i], &data[j]), j))
                .collect();
            distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            distances.truncate(k);

            let rho = distances.iter().map(|(d, _)| *d).find(|d| *d > 0.0).unwrap_or(0.0);
            let sigma = smooth_sigma(&distances, rho, target);

            for &(d, j) in &distances {
                let w = if d <= rho { 1.0 } else { (-(d - rho) / sigma).exp() };
                let entry = directed.entry((i.min(j), i.max(j))).or_insert((0.0, 0.0));
                if i < j {
                    entry.0 = w;
                } else {
                    entry.1 = w;
                }
            }
        }

        directed
            .into_iter()
            .map(|((head, tail), (a, b))| Edge {
                head,
                tail,
                weight: a + b - a * b,
            })
            .filter(|e| e.weight > 0.0)
            .collect()
    }
}

/// Binary search for sigma so the neighbour memberships sum to `target`.
fn smooth_sigma(distances: &[(f64, usize)], rho: f64, target: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0;
    for _ in 0..SIGMA_ITERATIONS {
        let sum: f64 = distances
            .iter()
            .map(|(d, _)| {
                let gap = d - rho;
                if gap > 0.0 {
                    (-gap / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();
        if (sum - target).abs() < SIGMA_TOLERANCE {
            break;
        }
        if sum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }
    mid.max(1e-3 * mean_distance(distances))
        .max(f64::MIN_POSITIVE)
}

fn mean_distance(distances: &[(f64, usize)]) -> f64 {
    if distances.is_empty() {
        return 0.0;
    }
    distances.iter().map(|(d, _)| d).sum::<f64>() / distances.len() as f64
}

pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = f64::from(*x) - f64::from(*y);
                d * d
            })
            .sum::<f64>()
            .sqrt(),
        DistanceMetric::Cosine => {
            let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
            for (x, y) in a.iter().zip(b) {
                let (x, y) = (f64::from(*x), f64::from(*y));
                dot += x * y;
                na += x * x;
                nb += y * y;
            }
            if na == 0.0 || nb == 0.0 {
                return 1.0;
            }
            (1.0 - dot / (na.sqrt() * nb.sqrt())).max(0.0)
        }
    }
}

fn optimize_layout(embedding: &mut Array2<f64>, edges: &[Edge], n_epochs: usize, rng: &mut StdRng) {
    if edges.is_empty() || n_epochs == 0 {
        return;
    }
    let n = embedding.nrows();
    let dim = embedding.ncols();
    let max_weight = edges.iter().map(|e| e.weight).fold(0.0, f64::max);

    // Edges too weak to be sampled even once are dropped, as in reference UMAP.
    let min_weight = max_weight / n_epochs as f64;
    let edges: Vec<Edge> = edges.iter().copied().filter(|e| e.weight >= min_weight).collect();
    let epochs_per_sample: Vec<f64> = edges.iter().map(|e| max_weight / e.weight).collect();
    let mut next_sample = epochs_per_sample.clone();

    let mut grad = vec![0.0; dim];
    for epoch in 0..n_epochs {
        let alpha = 1.0 - epoch as f64 / n_epochs as f64;
        for (idx, edge) in edges.iter().enumerate() {
            if next_sample[idx] > (epoch + 1) as f64 {
                continue;
            }
            let (h, t) = (edge.head, edge.tail);

            let dist_sq = squared_distance(embedding, h, t);
            let coeff = if dist_sq > 0.0 {
                -2.0 * CURVE_A * CURVE_B * dist_sq.powf(CURVE_B - 1.0)
                    / (1.0 + CURVE_A * dist_sq.powf(CURVE_B))
            } else {
                0.0
            };
            for d in 0..dim {
                grad[d] = (coeff * (embedding[[h, d]] - embedding[[t, d]])).clamp(-GRAD_CLIP, GRAD_CLIP);
            }
            for d in 0..dim {
                embedding[[h, d]] += alpha * grad[d];
                embedding[[t, d]] -= alpha * grad[d];
            }

            for _ in 0..NEGATIVE_SAMPLES {
                let other = rng.random_range(0..n);
                if other == h {
                    continue;
                }
                let dist_sq = squared_distance(embedding, h, other);
                let coeff = if dist_sq > 0.0 {
                    2.0 * CURVE_B / ((0.001 + dist_sq) * (1.0 + CURVE_A * dist_sq.powf(CURVE_B)))
                } else {
                    0.0
                };
                for d in 0..dim {
                    let g = if coeff > 0.0 {
                        (coeff * (embedding[[h, d]] - embedding[[other, d]])).clamp(-GRAD_CLIP, GRAD_CLIP)
                    } else {
                        GRAD_CLIP
                    };
                    embedding[[h, d]] += alpha * g;
                }
            }

            next_sample[idx] += epochs_per_sample[idx];
        }
    }
}

fn squared_distance(embedding: &Array2<f64>, a: usize, b: usize) -> f64 {
    embedding
        .row(a)
        .iter()
        .zip(embedding.row(b).iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}
