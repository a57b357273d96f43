use thiserror::Error;

use crate::llm::provider::ProviderError;

/// Failures surfaced by the embedding orchestrator.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("vector dimension mismatch at index {index}: expected {expected}, got {found}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("result size mismatch: provider returned {returned} vectors for {requested} inputs")]
    CountMismatch { requested: usize, returned: usize },

    #[error("all embedding keys exhausted after {attempts} attempts: {last_error}")]
    KeysExhausted { attempts: usize, last_error: String },

    #[error("embedding provider rejected the request: {0}")]
    Provider(ProviderError),
}

#[derive(Debug, Error)]
pub enum RaptorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Completion error: {0}")]
    Completion(ProviderError),

    #[error("Build timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type RaptorResult<T> = Result<T, RaptorError>;
