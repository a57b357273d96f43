use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use raptor_tree::config::load_config;
use raptor_tree::llm::registry::ProviderRegistry;
use raptor_tree::{Chunk, RaptorResult};

#[derive(Parser, Debug)]
#[command(
    name = "raptor-tree",
    about = "Build a hierarchical summary tree over embedded chunks"
)]
struct Cli {
    /// Path to config.toml; defaults to the usual search locations
    #[arg(long, global = true, env = "RAPTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read chunks, build the tree, write the result
    Build {
        /// JSON array of `{ "content": ..., "vector": [...] }` records
        #[arg(long)]
        input: PathBuf,

        /// Where to write the build result as JSON
        #[arg(long)]
        output: PathBuf,

        /// Override `[raptor].max_clusters`
        #[arg(long)]
        max_clusters: Option<usize>,

        /// Override `[raptor].max_levels`
        #[arg(long)]
        max_levels: Option<usize>,

        /// Override `[raptor].random_seed`
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    raptor_tree::init_tracing("info");
    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "raptor-tree failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> RaptorResult<()> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Build {
            input,
            output,
            max_clusters,
            max_levels,
            seed,
        } => {
            if let Some(v) = max_clusters {
                config.raptor.max_clusters = v;
            }
            if let Some(v) = max_levels {
                config.raptor.max_levels = v;
            }
            if let Some(v) = seed {
                config.raptor.random_seed = v;
            }
            config.validate()?;

            let raw = tokio::fs::read_to_string(&input).await?;
            let chunks: Vec<Chunk> = serde_json::from_str(&raw)?;
            tracing::info!(path = %input.display(), chunks = chunks.len(), "chunks loaded");

            let registry = ProviderRegistry::from_config(&config)?;
            let builder = registry
                .tree_builder()
                .with_progress(Arc::new(|line: &str| tracing::info!(progress = line)));
            let result = builder.build(chunks).await?;
            log_cache_stats(&registry);

            let json = serde_json::to_string_pretty(&result)?;
            tokio::fs::write(&output, json).await?;
            tracing::info!(
                path = %output.display(),
                nodes = result.nodes.len(),
                levels_built = result.levels_built,
                "tree written"
            );
            Ok(())
        }
    }
}

fn log_cache_stats(registry: &ProviderRegistry) {
    let caches = [
        ("embedding", registry.embed_cache().map(|c| c.stats())),
        ("completion", registry.llm_cache().map(|c| c.stats())),
    ];
    for (cache, stats) in caches {
        if let Some(stats) = stats {
            tracing::info!(
                cache,
                hits = stats.hits,
                misses = stats.misses,
                expired = stats.expired,
                sets = stats.sets,
                "cache stats"
            );
        }
    }
}
