use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::types::{ChatMessage, Completion, GenerationConfig};

/// How a failed provider call should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    Authentication,
    InvalidRequest,
    Timeout,
    Transient,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transient(_) | Self::Malformed(_) => ErrorKind::Transient,
        }
    }

    /// Map an HTTP status and body to an error; only called for non-success statuses.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            401 | 403 => Self::Authentication(format!("HTTP {status}: {body}")),
            400 | 404 | 413 | 422 => Self::InvalidRequest(format!("HTTP {status}: {body}")),
            _ => Self::Transient(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

/// Embedding capability bound to a single credential.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier used in logs; never the secret itself.
    fn name(&self) -> &str;

    /// Returns one vector per input, in input order.
    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        dimension: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        gen: GenerationConfig,
    ) -> Result<Completion, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ProviderError::from_status(429, String::new(), None).kind(), ErrorKind::RateLimited);
        assert_eq!(ProviderError::from_status(401, String::new(), None).kind(), ErrorKind::Authentication);
        assert_eq!(ProviderError::from_status(422, String::new(), None).kind(), ErrorKind::InvalidRequest);
        assert_eq!(ProviderError::from_status(503, String::new(), None).kind(), ErrorKind::Transient);
    }

    #[test]
    fn malformed_is_retried_like_transient() {
        assert_eq!(ProviderError::Malformed("x".into()).kind(), ErrorKind::Transient);
    }
}
