use serde::Serialize;

use crate::tree::types::{ClusterAssignment, ContentNode};

/// Lifecycle states of one tree build.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    Seeded,
    Clustering { level: usize },
    Summarizing { level: usize, assignment: ClusterAssignment },
    Embedding { level: usize, summaries: Vec<String> },
    LayerComplete { level: usize, nodes: Vec<ContentNode> },
    Done { reason: DoneReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// Fewer than two valid chunks; nothing to summarize.
    TooFewNodes,
    /// The top layer holds a single node.
    SingleRoot,
    /// `max_levels` was reached with more than one node left.
    LevelCap,
}

impl BuildState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Seeded => "seeded",
            Self::Clustering { .. } => "clustering",
            Self::Summarizing { .. } => "summarizing",
            Self::Embedding { .. } => "embedding",
            Self::LayerComplete { .. } => "layer_complete",
            Self::Done { .. } => "done",
        }
    }
}
