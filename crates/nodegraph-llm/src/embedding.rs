use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nodegraph_core::config::LlmConfig;
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::llm::Embedder;

/// [`Embedder`] for any endpoint speaking the OpenAI `/embeddings` protocol.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.embedding_url.trim_end_matches('/').to_string(),
            api_key: config.embedding_api_key.clone(),
            model: config.embedding_model.clone(),
        }
    }

    fn order(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
        if data.len() != expected {
            return Err(NodeGraphError::Provider(format!(
                "embedding endpoint returned {} vectors for {expected} inputs",
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| NodeGraphError::Provider("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| NodeGraphError::Provider(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(NodeGraphError::Provider(format!(
                "embedding endpoint returned status {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        tracing::debug!(inputs = texts.len(), model = %self.model, "Embedded batch");
        Self::order(parsed.data, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_restores_input_order() {
        let data = vec![
            EmbeddingData { index: 1, embedding: vec![1.0] },
            EmbeddingData { index: 0, embedding: vec![0.0] },
        ];
        let ordered = OpenAiEmbedder::order(data, 2).unwrap();
        assert_eq!(ordered, vec![vec![0.0], vec![1.0]]);
    }

    #[test]
    fn test_order_rejects_count_mismatch() {
        let data = vec![EmbeddingData { index: 0, embedding: vec![0.0] }];
        assert!(OpenAiEmbedder::order(data, 3).is_err());
    }
}
