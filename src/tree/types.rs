use serde::{Deserialize, Serialize};

/// One level-0 input record: chunk text and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub vector: Vec<f32>,
}

impl Chunk {
    /// Chunks with empty content or an empty vector are skipped by the builder.
    pub fn is_valid(&self) -> bool {
        !self.content.trim().is_empty() && !self.vector.is_empty()
    }
}

/// A node of the tree. Level 0 holds the original chunks; higher levels hold summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub content: String,
    pub vector: Vec<f32>,
    pub level: usize,
}

/// Half-open range `[start, end)` of arena indices holding one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub level: usize,
    pub start: usize,
    pub end: usize,
}

impl Layer {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Hard cluster labels for every node of one layer, positions relative to the layer start.
/// Labels are dense: every id in `[0, n_clusters)` has at least one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub level: usize,
    pub labels: Vec<usize>,
    pub n_clusters: usize,
}

impl ClusterAssignment {
    /// Member positions per cluster id, each list in ascending order.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_clusters];
        for (pos, &label) in self.labels.iter().enumerate() {
            if let Some(bucket) = members.get_mut(label) {
                bucket.push(pos);
            }
        }
        members
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub nodes: Vec<ContentNode>,
    pub layers: Vec<Layer>,
    pub assignments: Vec<ClusterAssignment>,
    pub levels_built: usize,
    pub original_count: usize,
}

impl BuildResult {
    /// Nodes of the top layer; a single root when the build converged.
    pub fn top_layer(&self) -> &[ContentNode] {
        match self.layers.last() {
            Some(layer) => &self.nodes[layer.start..layer.end],
            None => &[],
        }
    }
}

/// Append-only node storage. Each appended batch becomes a sealed layer.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<ContentNode>,
    layers: Vec<Layer>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `nodes` as the next level and return its layer.
    pub fn seal_layer(&mut self, nodes: Vec<ContentNode>) -> Layer {
        let level = self.layers.len();
        let start = self.nodes.len();
        self.nodes.extend(nodes.into_iter().map(|mut node| {
            node.level = level;
            node
        }));
        let layer = Layer {
            level,
            start,
            end: self.nodes.len(),
        };
        self.layers.push(layer);
        layer
    }

    pub fn current(&self) -> Option<Layer> {
        self.layers.last().copied()
    }

    pub fn slice(&self, layer: Layer) -> &[ContentNode] {
        &self.nodes[layer.start..layer.end]
    }

    pub fn into_parts(self) -> (Vec<ContentNode>, Vec<Layer>) {
        (self.nodes, self.layers)
    }
}
