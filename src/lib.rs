pub mod cache;
pub mod config;
pub mod embed;
pub mod errors;
pub mod llm;
pub mod retry;
pub mod summarize;
pub mod tree;

pub use errors::{EmbeddingError, RaptorError, RaptorResult};
pub use tree::{build_tree, BuildResult, Chunk, ContentNode, TreeBuilder};

/// Install the global tracing subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}
