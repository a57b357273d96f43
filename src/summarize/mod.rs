//! Cluster summarization through the completion provider.
//!
//! Every call is cache-first. Misses go through a global concurrency bound, a
//! fixed pacing interval and bounded retries. When retries run out,
//! [`Summarizer::summarize`] returns [`fallback_summary`]; authentication and
//! invalid-request failures are returned to the caller instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::cache::{completion_cache_key, CacheStore};
use crate::config::LlmConfig;
use crate::llm::provider::{CompletionProvider, ErrorKind, ProviderError};
use crate::llm::types::{ChatMessage, GenerationConfig};
use crate::retry::{decide, RetryDecision, RetryPolicy};

const FALLBACK_MEMBERS: usize = 3;

pub struct Summarizer {
    provider: Arc<dyn CompletionProvider>,
    cache: Option<Arc<dyn CacheStore<String>>>,
    cache_ttl: Duration,
    model: String,
    system_prompt: String,
    gen: GenerationConfig,
    permits: Semaphore,
    min_interval: Duration,
    next_request_at: Mutex<Option<Instant>>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl Summarizer {
    pub fn new(config: &LlmConfig, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            cache: None,
            cache_ttl: Duration::ZERO,
            model: config.model.clone(),
            system_prompt: config
                .summary_prompt
                .replace("{max_tokens}", &config.max_tokens.to_string()),
            gen: GenerationConfig {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            },
            permits: Semaphore::new(config.concurrency.max(1)),
            min_interval: config.min_interval(),
            next_request_at: Mutex::new(None),
            request_timeout: config.request_timeout(),
            retry: RetryPolicy {
                max_attempts: config.max_retries.max(1),
                base: Duration::from_secs_f64(config.backoff_base_secs.max(0.0)),
                max: Duration::from_secs_f64(config.backoff_max_secs.max(0.0)),
                jitter: Duration::from_secs_f64(config.backoff_jitter_secs.max(0.0)),
            },
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore<String>>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = ttl;
        self
    }

    /// Summary of `members`, or the deterministic fallback once retryable failures
    /// are exhausted. Errors that no retry can fix are returned.
    pub async fn summarize(&self, members: &[String]) -> Result<String, ProviderError> {
        match self.try_summarize(members).await {
            Ok(summary) => Ok(summary),
            Err(err) if matches!(err.kind(), ErrorKind::Authentication | ErrorKind::InvalidRequest) => {
                tracing::error!(members = members.len(), error = %err, "summarization rejected");
                Err(err)
            }
            Err(err) => {
                tracing::error!(members = members.len(), error = %err, "summarization failed; using fallback");
                Ok(fallback_summary(members))
            }
        }
    }

    pub async fn try_summarize(&self, members: &[String]) -> Result<String, ProviderError> {
        if members.is_empty() {
            return Err(ProviderError::InvalidRequest("cluster has no members".into()));
        }

        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(render_members(members)),
        ];
        let key = completion_cache_key(&self.model, &self.system_prompt, &messages, &self.gen);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            tracing::debug!(members = members.len(), "summary cache hit");
            return Ok(hit);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // Held for one attempt only, never across a backoff sleep.
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;
            self.pace().await;

            let outcome = tokio::time::timeout(
                self.request_timeout,
                self.provider.complete(&self.model, &messages, self.gen),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.request_timeout)))
            .and_then(|completion| {
                let content = strip_fences(&completion.content);
                if content.is_empty() {
                    Err(ProviderError::Malformed("empty completion".into()))
                } else {
                    Ok(content)
                }
            });
            drop(permit);

            let err = match outcome {
                Ok(summary) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "completion succeeded after retry");
                    }
                    tracing::debug!(members = members.len(), chars = summary.len(), "cluster summarized");
                    if let Some(cache) = &self.cache {
                        cache.set(&key, summary.clone(), self.cache_ttl);
                    }
                    return Ok(summary);
                }
                Err(err) => err,
            };

            match decide(&err, attempt, &self.retry, false) {
                RetryDecision::RetrySameKey(delay) => {
                    tracing::warn!(
                        provider = %self.provider.name(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "completion attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::FailOver | RetryDecision::Abort => return Err(err),
            }
        }
    }

    /// Enforce the minimum spacing between outgoing completion requests.
    async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait = {
            let mut next = self.next_request_at.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |at| at.max(now));
            *next = Some(slot + self.min_interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "pacing completion request");
            tokio::time::sleep(wait).await;
        }
    }
}

/// `[chunk_{i}] {text}`, one member per line.
pub fn render_members(members: &[String]) -> String {
    members
        .iter()
        .enumerate()
        .map(|(i, text)| format!("[chunk_{i}] {text}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First sentence of up to three members joined by ". ", then "...".
pub fn fallback_summary(members: &[String]) -> String {
    let head = members
        .iter()
        .take(FALLBACK_MEMBERS)
        .map(|text| text.split('.').next().unwrap_or_default())
        .collect::<Vec<_>>()
        .join(". ");
    format!("{head}...")
}

fn strip_fences(content: &str) -> String {
    content.trim().replace("```", "").trim().to_string()
}
