//! Order-preserving batched embedding over the key pool.
//!
//! `embed` resolves cache hits first, packs the misses into token-budgeted
//! groups, runs the groups concurrently on the least-loaded keys and stitches
//! the vectors back into input order. A call either returns one vector per
//! input or an error; partial results are never returned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;

use crate::cache::{embedding_cache_key, CacheStore};
use crate::config::EmbeddingConfig;
use crate::embed::batch_sizer::AdaptiveBatchSizer;
use crate::embed::key_pool::{KeyPool, KeySlot};
use crate::embed::packing::{estimate_tokens, pack_by_budget};
use crate::errors::EmbeddingError;
use crate::llm::provider::{ErrorKind, ProviderError};
use crate::retry::{decide, RetryDecision, RetryPolicy};

pub struct EmbeddingOrchestrator {
    pool: Arc<KeyPool>,
    sizer: Arc<AdaptiveBatchSizer>,
    cache: Option<Arc<dyn CacheStore<Vec<f32>>>>,
    cache_ttl: Duration,
    model: String,
    dimension: usize,
    token_budget: usize,
    failover_rounds: usize,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl EmbeddingOrchestrator {
    pub fn new(config: &EmbeddingConfig, pool: Arc<KeyPool>, sizer: Arc<AdaptiveBatchSizer>) -> Self {
        Self {
            pool,
            sizer,
            cache: None,
            cache_ttl: Duration::ZERO,
            model: config.model.clone(),
            dimension: config.dimension,
            token_budget: config.token_budget.max(1),
            failover_rounds: config.failover_rounds.max(1),
            request_timeout: config.request_timeout(),
            retry: RetryPolicy {
                max_attempts: config.max_retries.max(1),
                base: Duration::from_millis(config.retry_base_delay_ms),
                max: Duration::from_millis(config.retry_max_delay_ms),
                jitter: Duration::from_millis(config.retry_jitter_ms),
            },
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore<Vec<f32>>>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// One vector per input text, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses = Vec::new();
        for (pos, text) in texts.iter().enumerate() {
            match self.cached(text) {
                Some(vector) => slots[pos] = Some(vector),
                None => misses.push(pos),
            }
        }
        tracing::info!(
            texts = texts.len(),
            cache_hits = texts.len() - misses.len(),
            misses = misses.len(),
            "embedding request"
        );

        if misses.len() == 1 {
            let pos = misses[0];
            let batch = vec![texts[pos].clone()];
            let mut vectors = self.run_group(batch, None).await?;
            check_count(1, &vectors)?;
            let vector = vectors.pop().unwrap_or_default();
            self.accept(pos, &texts[pos], vector, &mut slots)?;
        } else if !misses.is_empty() {
            let miss_texts: Vec<&str> = misses.iter().map(|&pos| texts[pos].as_str()).collect();
            let batch_size = self.sizer.batch_size(&self.model, misses.len());
            let groups = pack_by_budget(&miss_texts, self.token_budget, batch_size);
            let ranked = self.pool.ranked().await;
            tracing::debug!(groups = groups.len(), batch_size, keys = ranked.len(), "packed embedding groups");

            let runs = groups.iter().enumerate().map(|(i, group)| {
                let batch: Vec<String> = group.members.iter().map(|&m| texts[misses[m]].clone()).collect();
                let preferred = (!ranked.is_empty()).then(|| Arc::clone(&ranked[i % ranked.len()]));
                self.run_group(batch, preferred)
            });
            let outcomes = join_all(runs).await;

            for (group, outcome) in groups.iter().zip(outcomes) {
                let vectors = outcome?;
                check_count(group.members.len(), &vectors)?;
                for (&m, vector) in group.members.iter().zip(vectors) {
                    let pos = misses[m];
                    self.accept(pos, &texts[pos], vector, &mut slots)?;
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(pos, vector)| -> Result<Vec<f32>, EmbeddingError> {
                let vector = vector.ok_or(EmbeddingError::CountMismatch {
                    requested: texts.len(),
                    returned: pos,
                })?;
                self.check_dimension(pos, &vector)?;
                Ok(vector)
            })
            .collect()
    }

    fn cached(&self, text: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?;
        cache
            .get(&embedding_cache_key(&self.model, text))
            .filter(|v| v.len() == self.dimension)
    }

    fn accept(
        &self,
        pos: usize,
        text: &str,
        vector: Vec<f32>,
        slots: &mut [Option<Vec<f32>>],
    ) -> Result<(), EmbeddingError> {
        self.check_dimension(pos, &vector)?;
        if let Some(cache) = &self.cache {
            cache.set(&embedding_cache_key(&self.model, text), vector.clone(), self.cache_ttl);
        }
        slots[pos] = Some(vector);
        Ok(())
    }

    fn check_dimension(&self, index: usize, vector: &[f32]) -> Result<(), EmbeddingError> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                index,
                expected: self.dimension,
                found: vector.len(),
            });
        }
        Ok(())
    }

    /// Embed one group, failing over between keys until it succeeds, a
    /// non-retryable error occurs, or the attempt bound is spent.
    async fn run_group(
        &self,
        batch: Vec<String>,
        preferred: Option<Arc<KeySlot>>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let tokens: usize = batch.iter().map(|t| estimate_tokens(t)).sum();
        let max_attempts = self.failover_rounds * self.pool.len();
        let mut tried: HashSet<usize> = HashSet::new();
        let mut attempts = 0usize;
        let mut last_error = String::from("no attempt made");
        let mut next = preferred;

        'keys: while attempts < max_attempts {
            let slot = match next.take().filter(|s| !s.is_failed()) {
                Some(slot) => slot,
                None => match self.next_slot(&mut tried).await {
                    Some(slot) => slot,
                    None => break,
                },
            };
            tried.insert(slot.index());

            let mut key_attempt = 0u32;
            while attempts < max_attempts {
                attempts += 1;
                key_attempt += 1;

                let err = match self.call(&slot, &batch, tokens).await {
                    Ok(vectors) => {
                        self.pool.record_success(&slot);
                        return Ok(vectors);
                    }
                    Err(err) => err,
                };
                last_error = err.to_string();

                match decide(&err, key_attempt, &self.retry, true) {
                    RetryDecision::Abort => {
                        tracing::error!(key = %slot.label(), error = %err, "embedding request rejected");
                        return Err(EmbeddingError::Provider(err));
                    }
                    RetryDecision::FailOver => {
                        if err.kind() == ErrorKind::Authentication {
                            self.pool.disable(&slot);
                        } else {
                            self.pool.record_failure(&slot);
                        }
                        tracing::info!(key = %slot.label(), error = %err, attempts, "failing over to another key");
                        continue 'keys;
                    }
                    RetryDecision::RetrySameKey(delay) => {
                        self.pool.record_failure(&slot);
                        if slot.is_failed() {
                            continue 'keys;
                        }
                        tracing::warn!(
                            key = %slot.label(),
                            error = %err,
                            attempt = key_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying embedding request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(attempts, error = %last_error, "embedding keys exhausted");
        Err(EmbeddingError::KeysExhausted {
            attempts,
            last_error,
        })
    }

    /// Least-loaded key not yet tried in this round; starts a new round once
    /// every healthy key has been tried.
    async fn next_slot(&self, tried: &mut HashSet<usize>) -> Option<Arc<KeySlot>> {
        if let Some(slot) = self.pool.select_excluding(tried).await {
            return Some(slot);
        }
        tried.clear();
        self.pool.select().await
    }

    async fn call(
        &self,
        slot: &KeySlot,
        batch: &[String],
        tokens: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let _permit = slot
            .permits()
            .acquire()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        slot.limiter().acquire(tokens as u64).await;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.request_timeout,
            slot.provider().embed(batch, &self.model, self.dimension),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(self.request_timeout)));
        let latency = started.elapsed();
        self.sizer.record(&self.model, latency, outcome.is_ok());

        tracing::debug!(
            key = %slot.label(),
            inputs = batch.len(),
            tokens,
            latency_ms = latency.as_millis() as u64,
            ok = outcome.is_ok(),
            "embedding call finished"
        );
        outcome
    }
}

fn check_count(requested: usize, vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
    if vectors.len() != requested {
        return Err(EmbeddingError::CountMismatch {
            requested,
            returned: vectors.len(),
        });
    }
    Ok(())
}
