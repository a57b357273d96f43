use std::time::Duration;

use reqwest::header::RETRY_AFTER;

use crate::llm::provider::ProviderError;

pub mod ollama;
pub mod openai_compatible;

fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn error_for_status(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let after = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(status, body, after)
}
