#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raptor_tree::config::AppConfig;
use raptor_tree::llm::provider::{CompletionProvider, EmbeddingProvider, ProviderError};
use raptor_tree::llm::registry::ProviderRegistry;
use raptor_tree::llm::types::{ChatMessage, Completion, GenerationConfig};
use raptor_tree::Chunk;

pub const DIM: usize = 8;

/// Deterministic embedding derived from the text bytes.
pub fn text_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for (i, b) in text.bytes().enumerate() {
        v[i % DIM] += f32::from(b) / 255.0;
        v[(i * 7 + usize::from(b)) % DIM] += 0.5;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter().map(|x| x / norm).collect()
}

pub enum EmbedBehaviour {
    Ok,
    AlwaysRateLimited,
}

pub struct StubEmbedder {
    pub name: String,
    pub behaviour: EmbedBehaviour,
    pub calls: AtomicUsize,
}

impl StubEmbedder {
    pub fn new(name: &str, behaviour: EmbedBehaviour) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(
        &self,
        texts: &[String],
        _model: &str,
        _dimension: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            EmbedBehaviour::Ok => Ok(texts.iter().map(|t| text_vector(t)).collect()),
            EmbedBehaviour::AlwaysRateLimited => Err(ProviderError::RateLimited { retry_after: None }),
        }
    }
}

pub enum CompleteBehaviour {
    /// Echo the first words of every member line.
    Echo,
    AlwaysFail,
    /// Every call fails authentication.
    Rejected,
    Slow(Duration),
}

pub struct StubCompleter {
    pub behaviour: CompleteBehaviour,
    pub calls: AtomicUsize,
}

impl StubCompleter {
    pub fn new(behaviour: CompleteBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for StubCompleter {
    fn name(&self) -> &str {
        "stub-llm"
    }

    async fn complete(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _gen: GenerationConfig,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            CompleteBehaviour::AlwaysFail => Err(ProviderError::Transient("llm down".into())),
            CompleteBehaviour::Rejected => Err(ProviderError::Authentication("HTTP 401: bad key".into())),
            CompleteBehaviour::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(Completion {
                    content: "late summary".into(),
                })
            }
            CompleteBehaviour::Echo => {
                let user = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
                let heads: Vec<String> = user
                    .lines()
                    .map(|line| line.split_whitespace().skip(1).take(3).collect::<Vec<_>>().join(" "))
                    .collect();
                Ok(Completion {
                    content: format!("Summary of {} passages: {}", heads.len(), heads.join("; ")),
                })
            }
        }
    }
}

/// Fast settings: no pacing or windowed limits, tiny backoff.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.embedding.dimension = DIM;
    config.embedding.rpm_limit = 0;
    config.embedding.tpm_limit = 0;
    config.embedding.retry_base_delay_ms = 1;
    config.embedding.retry_max_delay_ms = 5;
    config.embedding.retry_jitter_ms = 0;
    config.llm.rpm_limit = 0;
    config.llm.backoff_base_secs = 0.001;
    config.llm.backoff_max_secs = 0.005;
    config.llm.backoff_jitter_secs = 0.0;
    config.raptor.max_clusters = 8;
    config
}

pub fn registry(
    config: &AppConfig,
    embedders: Vec<Arc<StubEmbedder>>,
    completer: Arc<StubCompleter>,
) -> ProviderRegistry {
    let embedders: Vec<Arc<dyn EmbeddingProvider>> = embedders
        .into_iter()
        .map(|e| e as Arc<dyn EmbeddingProvider>)
        .collect();
    ProviderRegistry::with_providers(config, embedders, completer).expect("registry")
}

const TOPICS: [&str; 4] = ["rivers", "volcanoes", "markets", "orchestras"];

/// `n` chunks spread over four topics; vectors sit near one axis per topic.
pub fn topic_chunks(n: usize) -> Vec<Chunk> {
    (0..n)
        .map(|i| {
            let topic = i % TOPICS.len();
            let mut vector = vec![0.05f32; DIM];
            vector[topic * 2] = 1.0;
            vector[topic * 2 + 1] = 0.3 + 0.02 * (i / TOPICS.len()) as f32;
            vector[(i * 3) % DIM] += 0.05;
            Chunk {
                content: format!(
                    "Passage {i} about {}. It adds detail number {i} for the record.",
                    TOPICS[topic]
                ),
                vector,
            }
        })
        .collect()
}
