use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Text-embedding capability. One call embeds a whole batch; the semantic
/// ranker slices its candidates so no single request grows unbounded.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

pub struct GeminiEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiEmbedder {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl TextEmbedder for GeminiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<_> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] },
                })
            })
            .collect();

        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            self.base_url, self.model
        );
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({ "requests": requests }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "embedding request failed with status {status}: {body}"
            ));
        }

        let decoded = response.json::<BatchEmbedResponse>().await?;
        if decoded.embeddings.len() != texts.len() {
            return Err(anyhow!(
                "embedding count mismatch: sent {} texts, got {} vectors",
                texts.len(),
                decoded.embeddings.len()
            ));
        }

        debug!(target: "picstudio.embeddings", count = texts.len(), "embedded batch");
        Ok(decoded
            .embeddings
            .into_iter()
            .map(|entry| entry.values)
            .collect())
    }
}
