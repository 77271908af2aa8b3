#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use nodegraph_core::config::{AppConfig, DispatchPolicy, OrchestrationConfig};
use nodegraph_core::error::Result;
use nodegraph_core::graph::NodeKind;
use nodegraph_core::hashing::IdAllocator;
use nodegraph_core::llm::{Embedder, LlmBackend, LlmRequest, LlmResponse};
use nodegraph_core::records::{write_jsonl, NodeRecord, RecordStore};
use nodegraph_extraction::{DecompositionReport, SourceText, TextDecomposer};
use nodegraph_graph::{BuildOutcome, GraphBuilder, JsonlRecordStore};
use nodegraph_llm::OrchestrationClient;

/// Replies by prompt substring, first match wins. Counts every call.
pub struct ScriptedBackend {
    rules: Vec<(String, LlmResponse)>,
    fallback: LlmResponse,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: LlmResponse::Failure("no scripted reply".into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on(mut self, needle: &str, reply: LlmResponse) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rules
            .iter()
            .find(|(needle, _)| request.query.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// One decomposition reply with a single semantic unit.
pub fn decomposition(semantic_unit: &str, entities: &[&str], relationships: &[&str]) -> LlmResponse {
    LlmResponse::Structured(json!({"Output": [unit(semantic_unit, entities, relationships)]}))
}

pub fn unit(semantic_unit: &str, entities: &[&str], relationships: &[&str]) -> Value {
    json!({
        "semantic_unit": semantic_unit,
        "entities": entities,
        "relationships": relationships,
    })
}

/// Bag-of-words embedder: each lowercased token bumps one of 32 buckets.
pub struct TokenEmbedder;

#[async_trait]
impl Embedder for TokenEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; 32];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = token
                .to_lowercase()
                .bytes()
                .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            vector[bucket % 32] += 1.0;
        }
        Ok(vector)
    }
}

/// A cache directory plus the config pointing at it.
pub struct Workspace {
    _dir: TempDir,
    pub config: AppConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_env().unwrap();
        config.cache_dir = dir.path().to_path_buf();
        config.neo4j.enabled = false;
        config.orchestration = OrchestrationConfig {
            dispatch: DispatchPolicy::Bounded { max_in_flight: 4 },
            request_delay: Duration::ZERO,
        };
        Self { _dir: dir, config }
    }

    pub async fn write_sources(&self, texts: &[(&str, &str)]) {
        let sources: Vec<SourceText> = texts
            .iter()
            .map(|(id, text)| SourceText {
                text_id: id.to_string(),
                raw_text: text.to_string(),
            })
            .collect();
        write_jsonl(&self.config.text_units_path(), &sources).await.unwrap();
    }

    pub fn client(&self, backend: Arc<ScriptedBackend>) -> Arc<OrchestrationClient> {
        Arc::new(OrchestrationClient::new(backend, &self.config.orchestration))
    }

    pub fn decomposer(&self, backend: Arc<ScriptedBackend>) -> TextDecomposer {
        TextDecomposer::new(self.client(backend), &self.config)
    }

    /// Graph construction with a fresh id allocator, as a new process would.
    pub async fn construct(&self, backend: Arc<ScriptedBackend>) -> Result<BuildOutcome> {
        GraphBuilder::new(
            self.client(backend),
            Arc::new(self.record_store()),
            Arc::new(IdAllocator::new()),
            &self.config,
        )
        .run()
        .await
    }

    /// Decompose then construct, both against the same backend.
    pub async fn build(&self, backend: Arc<ScriptedBackend>) -> (DecompositionReport, BuildOutcome) {
        let report = self.decomposer(backend.clone()).run().await.unwrap();
        let outcome = self.construct(backend).await.unwrap();
        (report, outcome)
    }

    pub fn record_store(&self) -> JsonlRecordStore {
        JsonlRecordStore::new(self.config.records_dir())
    }

    pub async fn records(&self, kind: NodeKind) -> Vec<NodeRecord> {
        self.record_store().load(kind).await.unwrap()
    }
}
