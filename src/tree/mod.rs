pub mod builder;
pub mod cluster;
pub mod gmm;
pub mod state;
pub mod types;
pub mod umap;

pub use builder::{ProgressFn, TreeBuilder};
pub use types::{BuildResult, Chunk, ClusterAssignment, ContentNode, Layer};

use crate::config::AppConfig;
use crate::errors::RaptorResult;
use crate::llm::registry::ProviderRegistry;

/// Build a tree over `chunks` using providers constructed from `config`.
pub async fn build_tree(chunks: Vec<Chunk>, config: &AppConfig) -> RaptorResult<BuildResult> {
    let registry = ProviderRegistry::from_config(config)?;
    registry.tree_builder().build(chunks).await
}
