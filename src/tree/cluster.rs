//! Reduce, choose a cluster count, assign one label per node.

use ndarray::Array2;

use crate::config::{DistanceMetric, RaptorConfig};
use crate::errors::{RaptorError, RaptorResult};
use crate::tree::gmm::{FittedMixture, GaussianMixture};
use crate::tree::umap::Projection;

#[derive(Debug, Clone)]
pub struct ClusterStage {
    pub max_clusters: usize,
    pub threshold: f64,
    pub random_seed: u64,
    pub n_components: usize,
    pub metric: DistanceMetric,
}

/// Dense labels for one layer: every id in `[0, n_clusters)` has a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOutcome {
    pub labels: Vec<usize>,
    pub n_clusters: usize,
}

impl ClusterOutcome {
    fn single(n: usize) -> Self {
        Self {
            labels: vec![0; n],
            n_clusters: 1,
        }
    }
}

impl From<&RaptorConfig> for ClusterStage {
    fn from(config: &RaptorConfig) -> Self {
        Self {
            max_clusters: config.max_clusters,
            threshold: config.similarity_threshold,
            random_seed: config.random_seed,
            n_components: config.umap_n_components,
            metric: config.umap_metric,
        }
    }
}

impl ClusterStage {
    pub fn run(&self, vectors: &[Vec<f32>]) -> RaptorResult<ClusterOutcome> {
        let n = vectors.len();
        let dim = match vectors.first() {
            Some(v) if !v.is_empty() => v.len(),
            _ => return Err(RaptorError::Clustering("no vectors to cluster".into())),
        };
        if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dim) {
            return Err(RaptorError::Clustering(format!(
                "vector {i} has dimension {}, expected {dim}",
                v.len()
            )));
        }
        if vectors.iter().flatten().any(|x| !x.is_finite()) {
            return Err(RaptorError::Clustering("input vectors contain non-finite values".into()));
        }

        if n <= 2 {
            return Ok(ClusterOutcome::single(n));
        }

        let projection = Projection {
            n_neighbors: neighbours_for(n),
            n_components: self.n_components.min(n - 2).max(1),
            metric: self.metric,
            seed: self.random_seed,
            n_epochs: None,
        };
        let reduced = projection.fit_transform(vectors)?;

        let (k, fitted) = self.select_components(&reduced)?;
        tracing::debug!(nodes = n, k, n_neighbors = projection.n_neighbors, "cluster count selected");

        let Some(model) = fitted.filter(|_| k > 1) else {
            return Ok(ClusterOutcome::single(n));
        };

        if !model.converged() {
            tracing::debug!(k, "mixture hit the iteration cap before converging");
        }
        let proba = model.predict_proba(&reduced)?;
        Ok(densify(&assign(&proba, self.threshold), k))
    }

    /// Lowest-BIC component count in `[1, min(max_clusters, n))`, with its fitted model.
    fn select_components(&self, reduced: &Array2<f64>) -> RaptorResult<(usize, Option<FittedMixture>)> {
        let n = reduced.nrows();
        let upper = self.max_clusters.min(n);
        if upper <= 1 {
            return Ok((1, None));
        }

        let mut best: Option<(f64, usize, FittedMixture)> = None;
        for k in 1..upper {
            let fitted = GaussianMixture::new(k, self.random_seed).fit(reduced)?;
            let bic = fitted.bic();
            if !bic.is_finite() {
                return Err(RaptorError::Clustering(format!("non-finite BIC for k={k}")));
            }
            if best.as_ref().map_or(true, |(b, _, _)| bic < *b) {
                best = Some((bic, k, fitted));
            }
        }
        Ok(match best {
            Some((_, k, fitted)) => (k, Some(fitted)),
            None => (1, None),
        })
    }
}

/// `max(2, floor((n - 1)^0.8))`.
pub fn neighbours_for(n: usize) -> usize {
    let raw = ((n.saturating_sub(1)) as f64).powf(0.8).floor() as usize;
    raw.max(2)
}

/// First component whose probability exceeds `threshold`, otherwise the most probable one.
fn assign(proba: &Array2<f64>, threshold: f64) -> Vec<usize> {
    proba
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .position(|&p| p > threshold)
                .unwrap_or_else(|| argmax(row.iter().copied()))
        })
        .collect()
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

/// Renumber labels so only populated components keep an id, in ascending component order.
fn densify(raw: &[usize], k: usize) -> ClusterOutcome {
    let mut used = vec![false; k];
    for &label in raw {
        used[label] = true;
    }
    let mut remap = vec![0; k];
    let mut next = 0;
    for (component, &is_used) in used.iter().enumerate() {
        if is_used {
            remap[component] = next;
            next += 1;
        }
    }
    ClusterOutcome {
        labels: raw.iter().map(|&label| remap[label]).collect(),
        n_clusters: next.max(1),
    }
}
