//! Credential slots for the embedding provider.
//!
//! Each [`KeySlot`] binds one credential to its own provider client, sliding-window
//! limiter and in-flight semaphore. [`KeyPool`] ranks healthy slots by windowed
//! usage so work lands on the least-loaded key first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;

use crate::embed::rate_limiter::{RateLimiter, WindowUsage};
use crate::errors::{RaptorError, RaptorResult};
use crate::llm::provider::EmbeddingProvider;

const TOKEN_WEIGHT: f64 = 0.8;
const REQUEST_WEIGHT: f64 = 0.2;

#[derive(Debug, Default)]
struct SlotState {
    consecutive_failures: u32,
    is_failed: bool,
    total_requests: u64,
    total_failures: u64,
}

/// Point-in-time view of one slot, safe to log.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatus {
    pub index: usize,
    pub label: String,
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    pub consecutive_failures: u32,
    pub is_failed: bool,
    pub total_requests: u64,
    pub total_failures: u64,
}

pub struct KeySlot {
    index: usize,
    label: String,
    provider: Arc<dyn EmbeddingProvider>,
    limiter: RateLimiter,
    permits: Semaphore,
    state: Mutex<SlotState>,
}

impl KeySlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn permits(&self) -> &Semaphore {
        &self.permits
    }

    pub fn is_failed(&self) -> bool {
        self.state().is_failed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state().consecutive_failures
    }

    async fn score(&self) -> f64 {
        let usage = self.limiter.usage().await;
        load_score(usage, self.limiter.rpm(), self.limiter.tpm())
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_score(usage: WindowUsage, rpm: u32, tpm: u64) -> f64 {
    let token_ratio = if tpm == 0 { 0.0 } else { usage.tokens as f64 / tpm as f64 };
    let request_ratio = if rpm == 0 { 0.0 } else { f64::from(usage.requests) / f64::from(rpm) };
    TOKEN_WEIGHT * token_ratio + REQUEST_WEIGHT * request_ratio
}

pub struct KeyPool {
    slots: Vec<Arc<KeySlot>>,
    failure_threshold: u32,
}

impl KeyPool {
    /// One slot per provider; each provider must carry a distinct credential.
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        rpm: u32,
        tpm: u64,
        window: std::time::Duration,
        per_key_concurrency: usize,
        failure_threshold: u32,
    ) -> RaptorResult<Self> {
        if providers.len() < 2 {
            return Err(RaptorError::Config(format!(
                "at least 2 embedding credentials are required, got {}",
                providers.len()
            )));
        }
        let slots = providers
            .into_iter()
            .enumerate()
            .map(|(index, provider)| {
                Arc::new(KeySlot {
                    index,
                    label: provider.name().to_string(),
                    provider,
                    limiter: RateLimiter::new(rpm, tpm, window),
                    permits: Semaphore::new(per_key_concurrency.max(1)),
                    state: Mutex::new(SlotState::default()),
                })
            })
            .collect::<Vec<_>>();
        tracing::info!(keys = slots.len(), rpm, tpm, "embedding key pool ready");
        Ok(Self {
            slots,
            failure_threshold: failure_threshold.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Healthy slots ordered from least to most loaded. Ties keep slot order.
    /// When every slot is failed, all are reset first.
    pub async fn ranked(&self) -> Vec<Arc<KeySlot>> {
        self.reset_if_all_failed();
        let mut scored = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if !slot.is_failed() {
                scored.push((slot.score().await, Arc::clone(slot)));
            }
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.index.cmp(&b.1.index)));
        scored.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Least-loaded healthy slot not in `exclude`, or `None` when all healthy
    /// slots are excluded.
    pub async fn select_excluding(&self, exclude: &HashSet<usize>) -> Option<Arc<KeySlot>> {
        self.ranked()
            .await
            .into_iter()
            .find(|slot| !exclude.contains(&slot.index))
    }

    pub async fn select(&self) -> Option<Arc<KeySlot>> {
        self.select_excluding(&HashSet::new()).await
    }

    pub fn record_success(&self, slot: &KeySlot) {
        let mut state = slot.state();
        state.total_requests += 1;
        state.consecutive_failures = 0;
        if state.is_failed {
            tracing::info!(key = %slot.label, "embedding key recovered");
        }
        state.is_failed = false;
    }

    pub fn record_failure(&self, slot: &KeySlot) {
        let mut state = slot.state();
        state.total_requests += 1;
        state.total_failures += 1;
        state.consecutive_failures += 1;
        if !state.is_failed && state.consecutive_failures >= self.failure_threshold {
            state.is_failed = true;
            tracing::warn!(
                key = %slot.label,
                failures = state.consecutive_failures,
                "embedding key marked failed"
            );
        }
    }

    /// Take a slot out of rotation at once, e.g. after an authentication error.
    pub fn disable(&self, slot: &KeySlot) {
        let mut state = slot.state();
        state.total_requests += 1;
        state.total_failures += 1;
        state.consecutive_failures = state.consecutive_failures.max(self.failure_threshold);
        state.is_failed = true;
        tracing::warn!(key = %slot.label, "embedding key disabled");
    }

    pub async fn status(&self) -> Vec<SlotStatus> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let usage = slot.limiter.usage().await;
            let state = slot.state();
            out.push(SlotStatus {
                index: slot.index,
                label: slot.label.clone(),
                requests_in_window: usage.requests,
                tokens_in_window: usage.tokens,
                consecutive_failures: state.consecutive_failures,
                is_failed: state.is_failed,
                total_requests: state.total_requests,
                total_failures: state.total_failures,
            });
        }
        out
    }

    fn reset_if_all_failed(&self) {
        if !self.slots.iter().all(|slot| slot.is_failed()) {
            return;
        }
        tracing::warn!(keys = self.slots.len(), "all embedding keys failed; resetting pool");
        for slot in &self.slots {
            let mut state = slot.state();
            state.is_failed = false;
            state.consecutive_failures = 0;
        }
    }
}
