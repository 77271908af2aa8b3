use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Structured-output schemas the pipeline asks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSchema {
    /// `{"Output": [{"semantic_unit", "entities", "relationships"}]}`
    TextDecomposition,
    /// `{"source", "relationship", "target"}`
    RelationshipReconstruction,
}

impl ResponseSchema {
    /// JSON shape shown to the model.
    pub fn example(&self) -> &'static str {
        match self {
            ResponseSchema::TextDecomposition => {
                r#"{"Output": [{"semantic_unit": "paraphrased idea", "entities": ["ENTITY_A", "ENTITY_B"], "relationships": ["ENTITY_A, relation, ENTITY_B"]}]}"#
            }
            ResponseSchema::RelationshipReconstruction => {
                r#"{"source": "ENTITY_A", "relationship": "relation", "target": "ENTITY_B"}"#
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseSchema>,
}

impl LlmRequest {
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response_format: None,
        }
    }

    pub fn structured(query: impl Into<String>, schema: ResponseSchema) -> Self {
        Self {
            query: query.into(),
            response_format: Some(schema),
        }
    }
}

/// What a backend hands back for one generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmResponse {
    Structured(serde_json::Value),
    Raw(String),
    /// Provider-reported failure (error body, refusal, empty reply).
    Failure(String),
}

/// A text generation provider, selected once at configuration time.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Transport errors are returned as `Err`; provider-level failures as
    /// [`LlmResponse::Failure`].
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Approximate nearest-neighbour index over embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn insert(&self, id: &str, vector: Vec<f32>) -> Result<()>;

    /// Up to `k` `(id, score)` pairs, best first.
    async fn query_top_k(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>>;

    async fn size(&self) -> usize;
}

/// Parse a JSON object out of a model reply, tolerating markdown fences,
/// stray prose around the object and invisible spacing characters.
pub fn parse_json_reply(text: &str) -> Option<serde_json::Value> {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\u{202f}' && *c != '\u{a0}')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) {
        return value.is_object().then_some(value);
    }

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&cleaned[start..=end])
        .ok()
        .filter(|v| v.is_object())
}
