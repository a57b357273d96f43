use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::provider::{CompletionProvider, EmbeddingProvider, ProviderError};
use crate::llm::providers::{build_client, error_for_status};
use crate::llm::types::{ChatMessage, Completion, GenerationConfig};

/// `POST {api_base}/embeddings` client holding exactly one credential.
pub struct OpenAiCompatibleEmbedder {
    id: String,
    endpoint: String,
    api_key: String,
    dimension_field: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleEmbedder {
    pub fn new(
        id: String,
        api_base: &str,
        api_key: String,
        dimension_field: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            id,
            endpoint: format!("{}/embeddings", api_base.trim_end_matches('/')),
            api_key,
            dimension_field,
            client: build_client(timeout)?,
        })
    }

    fn request_body(&self, texts: &[String], model: &str, dimension: usize) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "input": texts,
        });
        if !self.dimension_field.is_empty() {
            body[self.dimension_field.as_str()] = serde_json::json!(dimension);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleEmbedder {
    fn name(&self) -> &str {
        &self.id
    }

    async fn embed(
        &self,
        texts: &[String],
        model: &str,
        dimension: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        tracing::debug!(provider = %self.id, inputs = texts.len(), "sending embedding request");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(texts, model, dimension))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parsed.data.sort_by_key(|entry| entry.index);
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

/// `POST {api_base}/chat/completions`, non-streaming.
pub struct OpenAiCompatibleProvider {
    id: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        id: String,
        api_base: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            id,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key,
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        gen: GenerationConfig,
    ) -> Result<Completion, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": gen.max_tokens,
            "temperature": gen.temperature,
            "stream": false,
        });

        tracing::debug!(
            provider = %self.id,
            model = %model,
            messages = messages.len(),
            "sending completion request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?
            .to_string();

        tracing::debug!(provider = %self.id, content_len = content.len(), "completion received");
        Ok(Completion { content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_field_is_configurable() {
        let texts = vec!["a".to_string()];
        let voyage = OpenAiCompatibleEmbedder::new(
            "k".into(),
            "https://api.voyageai.com/v1/",
            "secret".into(),
            "output_dimension".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(voyage.endpoint, "https://api.voyageai.com/v1/embeddings");
        let body = voyage.request_body(&texts, "voyage-3", 512);
        assert_eq!(body["output_dimension"], 512);
        assert!(body.get("dimensions").is_none());

        let plain = OpenAiCompatibleEmbedder::new(
            "k".into(),
            "http://localhost:1234/v1",
            "secret".into(),
            String::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        let body = plain.request_body(&texts, "m", 512);
        assert_eq!(body.as_object().map(|o| o.len()), Some(2));
    }

    #[test]
    fn embedding_response_is_reordered_by_index() {
        let raw = r#"{"data":[{"embedding":[2.0],"index":1},{"embedding":[1.0],"index":0}]}"#;
        let mut parsed: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        parsed.data.sort_by_key(|entry| entry.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|e| e.embedding).collect();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }
}
