use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::config::{AppConfig, EmbeddingBackend, EmbeddingConfig, RaptorConfig, EMBED_KEYS_ENV, LLM_KEY_ENV};
use crate::embed::batch_sizer::AdaptiveBatchSizer;
use crate::embed::key_pool::KeyPool;
use crate::embed::EmbeddingOrchestrator;
use crate::errors::{RaptorError, RaptorResult};
use crate::llm::provider::{CompletionProvider, EmbeddingProvider};
use crate::llm::providers::ollama::OllamaEmbedder;
use crate::llm::providers::openai_compatible::{OpenAiCompatibleEmbedder, OpenAiCompatibleProvider};
use crate::summarize::Summarizer;
use crate::tree::TreeBuilder;

/// Everything a build needs, constructed once from configuration and shared by reference.
pub struct ProviderRegistry {
    raptor: RaptorConfig,
    embed_cache: Option<Arc<TtlCache<Vec<f32>>>>,
    llm_cache: Option<Arc<TtlCache<String>>>,
    orchestrator: Arc<EmbeddingOrchestrator>,
    summarizer: Arc<Summarizer>,
}

fn remote_embedders(embedding: &EmbeddingConfig) -> RaptorResult<Vec<Arc<dyn EmbeddingProvider>>> {
    if embedding.api_keys.len() < 2 {
        return Err(RaptorError::Config(format!(
            "at least 2 embedding keys are required (set [embedding].api_keys or {EMBED_KEYS_ENV}), got {}",
            embedding.api_keys.len()
        )));
    }
    let mut embedders: Vec<Arc<dyn EmbeddingProvider>> = Vec::with_capacity(embedding.api_keys.len());
    for (i, key) in embedding.api_keys.iter().enumerate() {
        let embedder = OpenAiCompatibleEmbedder::new(
            format!("embed-key-{i}"),
            &embedding.api_base,
            key.clone(),
            embedding.dimension_field.clone(),
            embedding.request_timeout(),
        )?;
        embedders.push(Arc::new(embedder));
    }
    Ok(embedders)
}

/// A key-less local server still goes through the pool, one slot per lane.
fn local_embedders(embedding: &EmbeddingConfig) -> RaptorResult<Vec<Arc<dyn EmbeddingProvider>>> {
    let lanes = embedding.local_lanes.max(2);
    let mut embedders: Vec<Arc<dyn EmbeddingProvider>> = Vec::with_capacity(lanes);
    for i in 0..lanes {
        let embedder = OllamaEmbedder::new(format!("ollama-{i}"), &embedding.api_base, embedding.request_timeout())?;
        embedders.push(Arc::new(embedder));
    }
    Ok(embedders)
}

impl ProviderRegistry {
    /// Build HTTP adapters for every configured credential. Embedding keys come
    /// from `[embedding].api_keys` or `RAPTOR_EMBED_API_KEYS` (the Ollama backend
    /// needs none); the completion key from `[llm].api_key` or `RAPTOR_LLM_API_KEY`.
    pub fn from_config(config: &AppConfig) -> RaptorResult<Self> {
        let embedding = &config.embedding;
        let embedders = match embedding.backend {
            EmbeddingBackend::OpenaiCompatible => remote_embedders(embedding)?,
            EmbeddingBackend::Ollama => local_embedders(embedding)?,
        };

        let llm_key = config
            .llm
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RaptorError::Config(format!("no completion API key (set [llm].api_key or {LLM_KEY_ENV})")))?;
        let completion = OpenAiCompatibleProvider::new(
            config.llm.model.clone(),
            &config.llm.api_base,
            llm_key,
            config.llm.request_timeout(),
        )?;

        tracing::info!(
            embed_keys = embedders.len(),
            embed_model = %embedding.model,
            llm_model = %config.llm.model,
            "provider registry built"
        );
        Self::with_providers(config, embedders, Arc::new(completion))
    }

    /// Wire the given providers with caches, key pool, batch sizer, orchestrator and summarizer.
    pub fn with_providers(
        config: &AppConfig,
        embedders: Vec<Arc<dyn EmbeddingProvider>>,
        completion: Arc<dyn CompletionProvider>,
    ) -> RaptorResult<Self> {
        config.validate()?;
        let embedding = &config.embedding;
        let pool = KeyPool::new(
            embedders,
            embedding.rpm_limit,
            embedding.tpm_limit,
            embedding.window(),
            embedding.concurrency,
            embedding.failure_threshold,
        )?;
        let sizer = AdaptiveBatchSizer::new(embedding.batch.clone());

        let cache = &config.cache;
        let embed_cache = cache
            .embed_enabled
            .then(|| Arc::new(TtlCache::<Vec<f32>>::new("embedding", cache.embed_max_size)));
        let llm_cache = cache
            .llm_enabled
            .then(|| Arc::new(TtlCache::<String>::new("completion", cache.llm_max_size)));

        let mut orchestrator = EmbeddingOrchestrator::new(embedding, Arc::new(pool), Arc::new(sizer));
        if let Some(c) = &embed_cache {
            orchestrator = orchestrator.with_cache(c.clone(), Duration::from_secs(cache.embed_ttl_secs));
        }
        let mut summarizer = Summarizer::new(&config.llm, completion);
        if let Some(c) = &llm_cache {
            summarizer = summarizer.with_cache(c.clone(), Duration::from_secs(cache.llm_ttl_secs));
        }

        Ok(Self {
            raptor: config.raptor.clone(),
            embed_cache,
            llm_cache,
            orchestrator: Arc::new(orchestrator),
            summarizer: Arc::new(summarizer),
        })
    }

    pub fn orchestrator(&self) -> &Arc<EmbeddingOrchestrator> {
        &self.orchestrator
    }

    pub fn summarizer(&self) -> &Arc<Summarizer> {
        &self.summarizer
    }

    pub fn embed_cache(&self) -> Option<&Arc<TtlCache<Vec<f32>>>> {
        self.embed_cache.as_ref()
    }

    pub fn llm_cache(&self) -> Option<&Arc<TtlCache<String>>> {
        self.llm_cache.as_ref()
    }

    pub fn tree_builder(&self) -> TreeBuilder {
        TreeBuilder::new(&self.raptor, Arc::clone(&self.orchestrator), Arc::clone(&self.summarizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_embedding_key_is_rejected() {
        let mut config = AppConfig::default();
        config.embedding.api_keys = vec!["only".into()];
        config.llm.api_key = Some("llm".into());
        assert!(matches!(ProviderRegistry::from_config(&config), Err(RaptorError::Config(_))));
    }

    #[test]
    fn missing_completion_key_is_rejected() {
        let mut config = AppConfig::default();
        config.embedding.api_keys = vec!["a".into(), "b".into()];
        config.llm.api_key = None;
        assert!(matches!(ProviderRegistry::from_config(&config), Err(RaptorError::Config(_))));
    }

    #[test]
    fn ollama_backend_opens_lanes_without_keys() {
        let mut config = AppConfig::default();
        config.embedding.backend = EmbeddingBackend::Ollama;
        config.embedding.api_base = "http://localhost:11434".into();
        config.embedding.local_lanes = 3;
        config.llm.api_key = Some("llm".into());
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.orchestrator().pool().len(), 3);
    }

    #[test]
    fn http_registry_builds_with_two_keys() {
        let mut config = AppConfig::default();
        config.embedding.api_keys = vec!["a".into(), "b".into()];
        config.llm.api_key = Some("llm".into());
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.orchestrator().pool().len(), 2);
        assert!(registry.embed_cache().is_some());
        assert!(registry.llm_cache().is_some());
    }
}
