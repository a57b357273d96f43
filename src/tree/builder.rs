//! Recursive cluster → summarize → embed loop over sealed layers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::RaptorConfig;
use crate::embed::EmbeddingOrchestrator;
use crate::errors::{RaptorError, RaptorResult};
use crate::summarize::Summarizer;
use crate::tree::cluster::ClusterStage;
use crate::tree::state::{BuildState, DoneReason};
use crate::tree::types::{BuildResult, Chunk, ClusterAssignment, ContentNode, NodeArena};

/// Receives one human-readable line per completed layer.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

pub struct TreeBuilder {
    stage: ClusterStage,
    max_levels: usize,
    timeout: Option<Duration>,
    orchestrator: Arc<EmbeddingOrchestrator>,
    summarizer: Arc<Summarizer>,
    progress: Option<ProgressFn>,
}

impl TreeBuilder {
    pub fn new(
        config: &RaptorConfig,
        orchestrator: Arc<EmbeddingOrchestrator>,
        summarizer: Arc<Summarizer>,
    ) -> Self {
        Self {
            stage: ClusterStage::from(config),
            max_levels: config.max_levels.max(1),
            timeout: config.build_timeout_secs.map(Duration::from_secs),
            orchestrator,
            summarizer,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Build the tree over `chunks`. With a build timeout configured, exceeding it
    /// fails the whole build and discards any partial layers.
    pub async fn build(&self, chunks: Vec<Chunk>) -> RaptorResult<BuildResult> {
        let build_id = Uuid::new_v4();
        let span = tracing::info_span!("raptor_build", %build_id);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(chunks))
                .instrument(span)
                .await
                .map_err(|_| {
                    tracing::error!(%build_id, timeout_secs = limit.as_secs(), "tree build timed out");
                    RaptorError::Timeout(limit)
                })?,
            None => self.run(chunks).instrument(span).await,
        }
    }

    async fn run(&self, chunks: Vec<Chunk>) -> RaptorResult<BuildResult> {
        let started = Instant::now();
        let total = chunks.len();
        let seeds: Vec<ContentNode> = chunks
            .into_iter()
            .filter(Chunk::is_valid)
            .map(|chunk| ContentNode {
                content: chunk.content,
                vector: chunk.vector,
                level: 0,
            })
            .collect();
        if seeds.len() < total {
            tracing::warn!(skipped = total - seeds.len(), "dropping chunks with empty content or vector");
        }

        let original_count = seeds.len();
        let mut arena = NodeArena::new();
        arena.seal_layer(seeds);
        let mut assignments: Vec<ClusterAssignment> = Vec::new();
        tracing::info!(chunks = original_count, max_levels = self.max_levels, "tree build started");

        let mut state = BuildState::Seeded;
        let reason = loop {
            tracing::debug!(state = state.name(), "build state");
            state = match state {
                BuildState::Seeded => {
                    if original_count <= 1 {
                        BuildState::Done {
                            reason: DoneReason::TooFewNodes,
                        }
                    } else {
                        BuildState::Clustering { level: 0 }
                    }
                }

                BuildState::Clustering { level } => {
                    let assignment = self.cluster_layer(&arena, level).await?;
                    BuildState::Summarizing { level, assignment }
                }

                BuildState::Summarizing { level, assignment } => {
                    let summaries = self.summarize_layer(&arena, &assignment).await?;
                    assignments.push(assignment);
                    BuildState::Embedding { level, summaries }
                }

                BuildState::Embedding { level, summaries } => {
                    let t = Instant::now();
                    let vectors = self.orchestrator.embed(&summaries).await?;
                    tracing::info!(
                        level,
                        summaries = summaries.len(),
                        elapsed_ms = t.elapsed().as_millis() as u64,
                        "layer embedded"
                    );
                    let nodes = summaries
                        .into_iter()
                        .zip(vectors)
                        .map(|(content, vector)| ContentNode {
                            content,
                            vector,
                            level: level + 1,
                        })
                        .collect();
                    BuildState::LayerComplete { level, nodes }
                }

                BuildState::LayerComplete { level, nodes } => {
                    let before = arena.current().map_or(0, |layer| layer.len());
                    let layer = arena.seal_layer(nodes);
                    let message = format!("Layer {}: {} → {} clusters", layer.level, before, layer.len());
                    tracing::info!(level = layer.level, before, after = layer.len(), "layer complete");
                    if let Some(progress) = &self.progress {
                        progress(&message);
                    }

                    let next = level + 1;
                    if layer.len() <= 1 {
                        BuildState::Done {
                            reason: DoneReason::SingleRoot,
                        }
                    } else if next >= self.max_levels {
                        tracing::warn!(
                            levels = next,
                            remaining = layer.len(),
                            "level cap reached before a single root"
                        );
                        BuildState::Done {
                            reason: DoneReason::LevelCap,
                        }
                    } else {
                        BuildState::Clustering { level: next }
                    }
                }

                BuildState::Done { reason } => break reason,
            };
        };

        let (nodes, layers) = arena.into_parts();
        let levels_built = layers.len().saturating_sub(1);
        tracing::info!(
            ?reason,
            levels_built,
            nodes = nodes.len(),
            original = original_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tree build finished"
        );
        Ok(BuildResult {
            nodes,
            layers,
            assignments,
            levels_built,
            original_count,
        })
    }

    async fn cluster_layer(&self, arena: &NodeArena, level: usize) -> RaptorResult<ClusterAssignment> {
        let layer = arena
            .current()
            .ok_or_else(|| RaptorError::Clustering("no layer to cluster".into()))?;
        let vectors: Vec<Vec<f32>> = arena.slice(layer).iter().map(|n| n.vector.clone()).collect();
        let stage = self.stage.clone();
        let t = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || stage.run(&vectors))
            .await
            .map_err(|e| RaptorError::Clustering(format!("clustering worker failed: {e}")))??;

        tracing::info!(
            level,
            nodes = layer.len(),
            clusters = outcome.n_clusters,
            elapsed_ms = t.elapsed().as_millis() as u64,
            "layer clustered"
        );
        Ok(ClusterAssignment {
            level,
            labels: outcome.labels,
            n_clusters: outcome.n_clusters,
        })
    }

    /// One summary per cluster, in cluster-id order. All summaries finish before
    /// this returns; a summary the provider refuses outright fails the layer.
    async fn summarize_layer(
        &self,
        arena: &NodeArena,
        assignment: &ClusterAssignment,
    ) -> RaptorResult<Vec<String>> {
        let layer = arena
            .current()
            .ok_or_else(|| RaptorError::Clustering("no layer to summarize".into()))?;
        let nodes = arena.slice(layer);
        let t = Instant::now();

        let tasks = assignment
            .members()
            .into_iter()
            .filter(|members| !members.is_empty())
            .map(|members| {
                let texts: Vec<String> = members.iter().map(|&pos| nodes[pos].content.clone()).collect();
                async move { self.summarizer.summarize(&texts).await }
            });
        let summaries = join_all(tasks)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(RaptorError::Completion)?;

        tracing::info!(
            level = assignment.level,
            clusters = summaries.len(),
            elapsed_ms = t.elapsed().as_millis() as u64,
            "layer summarized"
        );
        Ok(summaries)
    }
}
