use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::provider::{EmbeddingProvider, ProviderError};
use crate::llm::providers::{build_client, error_for_status};

/// Local Ollama embedding endpoint (`POST {api_base}/api/embed`), e.g. `bge-m3`.
///
/// The model decides the output dimension; the orchestrator rejects vectors of
/// any other length.
pub struct OllamaEmbedder {
    id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(id: String, api_base: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            id,
            endpoint: format!("{}/api/embed", api_base.trim_end_matches('/')),
            client: build_client(timeout)?,
        })
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn name(&self) -> &str {
        &self.id
    }

    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        _dimension: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        tracing::debug!(provider = %self.id, inputs = texts.len(), "sending local embedding request");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model,
                input: texts,
                truncate: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_and_wire_shapes() {
        let embedder =
            OllamaEmbedder::new("ollama-0".into(), "http://localhost:11434/", Duration::from_secs(5)).unwrap();
        assert_eq!(embedder.endpoint, "http://localhost:11434/api/embed");

        let texts = vec!["hello".to_string()];
        let body = serde_json::to_value(EmbedRequest {
            model: "bge-m3",
            input: &texts,
            truncate: true,
        })
        .unwrap();
        assert_eq!(body["model"], "bge-m3");
        assert_eq!(body["input"][0], "hello");

        let parsed: EmbedResponse =
            serde_json::from_str(r#"{"model":"bge-m3","embeddings":[[0.1,0.2],[0.3,0.4]]}"#).unwrap();
        assert_eq!(parsed.embeddings.len(), 2);
    }
}
