//! Retry and failover policy shared by the embedding orchestrator and the summarizer.

use std::time::Duration;

use rand::Rng;

use crate::llm::provider::{ErrorKind, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts on one credential before the error is escalated.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): `min(base * 2^(attempt-1), max)` plus
    /// up to `jitter` of random slack.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter.is_zero() {
            return backoff;
        }
        let slack = rand::rng().random_range(0.0..=self.jitter.as_secs_f64());
        backoff + Duration::from_secs_f64(slack)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same credential after the given delay.
    RetrySameKey(Duration),
    /// Move to another credential immediately.
    FailOver,
    /// Stop; the error is not recoverable by retrying.
    Abort,
}

/// Decide what to do after `err` on attempt `attempt` (1-based) of one credential.
///
/// `can_fail_over` is false for single-provider callers such as the summarizer; for them
/// rate limits become delayed retries and authentication failures abort.
pub fn decide(
    err: &ProviderError,
    attempt: u32,
    policy: &RetryPolicy,
    can_fail_over: bool,
) -> RetryDecision {
    let exhausted = attempt >= policy.max_attempts;
    match err.kind() {
        ErrorKind::InvalidRequest => RetryDecision::Abort,
        ErrorKind::Authentication if can_fail_over => RetryDecision::FailOver,
        ErrorKind::Authentication => RetryDecision::Abort,
        ErrorKind::RateLimited if can_fail_over => RetryDecision::FailOver,
        ErrorKind::RateLimited if exhausted => RetryDecision::Abort,
        ErrorKind::RateLimited => {
            let hinted = match err {
                ProviderError::RateLimited { retry_after } => *retry_after,
                _ => None,
            };
            RetryDecision::RetrySameKey(hinted.unwrap_or_else(|| policy.delay(attempt)))
        }
        ErrorKind::Timeout | ErrorKind::Transient if exhausted => {
            if can_fail_over {
                RetryDecision::FailOver
            } else {
                RetryDecision::Abort
            }
        }
        ErrorKind::Timeout | ErrorKind::Transient => RetryDecision::RetrySameKey(policy.delay(attempt)),
    }
}
