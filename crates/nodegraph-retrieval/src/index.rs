use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use nodegraph_core::entity::normalize_name;
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::graph::NodeKind;
use nodegraph_core::llm::{Embedder, VectorIndex};
use nodegraph_core::records::NodeRecord;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Brute-force cosine index persisted as one JSON document.
#[derive(Default)]
pub struct FlatVectorIndex {
    vectors: RwLock<BTreeMap<String, Vec<f32>>>,
}

#[derive(Serialize, Deserialize)]
struct FlatIndexFile {
    vectors: BTreeMap<String, Vec<f32>>,
}

impl FlatVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing file loads as an empty index.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(body) => {
                let file: FlatIndexFile = serde_json::from_slice(&body)?;
                Ok(Self {
                    vectors: RwLock::new(file.vectors),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let vectors = self.vectors.read().await.clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec(&FlatIndexFile { vectors })?).await?;
        Ok(())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.vectors.read().await.contains_key(id)
    }
}

#[async_trait]
impl VectorIndex for FlatVectorIndex {
    async fn insert(&self, id: &str, vector: Vec<f32>) -> Result<()> {
        let mut vectors = self.vectors.write().await;
        if let Some(dim) = vectors.values().next().map(Vec::len) {
            if dim != vector.len() {
                return Err(NodeGraphError::Retrieval(format!(
                    "vector for {id} has dimension {}, index uses {dim}",
                    vector.len()
                )));
            }
        }
        vectors.insert(id.to_string(), vector);
        Ok(())
    }

    async fn query_top_k(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let vectors = self.vectors.read().await;
        let mut hits: Vec<(String, f32)> = vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(vector, v)))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn size(&self) -> usize {
        self.vectors.read().await.len()
    }
}

/// Embeds node records into a vector index.
pub struct EmbeddingIndexer<'a> {
    embedder: &'a dyn Embedder,
    index: &'a dyn VectorIndex,
    batch_size: usize,
}

impl<'a> EmbeddingIndexer<'a> {
    pub fn new(embedder: &'a dyn Embedder, index: &'a dyn VectorIndex) -> Self {
        Self {
            embedder,
            index,
            batch_size: 64,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed the context of every record and insert it under its hash id.
    /// Returns the number of vectors inserted.
    pub async fn index_records(&self, records: &[NodeRecord]) -> Result<usize> {
        let mut inserted = 0;
        for batch in records.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|r| r.context.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(NodeGraphError::Retrieval(format!(
                    "embedder returned {} vectors for {} records",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (record, vector) in batch.iter().zip(vectors) {
                self.index.insert(&record.hash_id, vector).await?;
                inserted += 1;
            }
            tracing::info!(inserted, total = records.len(), "Embedding progress");
        }
        Ok(inserted)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(normalize_name)
        .collect()
}

/// Exact entity-name lookup: a query matches an entity when the entity's
/// name tokens appear contiguously in the query.
#[derive(Debug, Default)]
pub struct EntityNameIndex {
    by_first_token: HashMap<String, Vec<(Vec<String>, String)>>,
}

impl EntityNameIndex {
    pub fn from_records(records: &[NodeRecord]) -> Self {
        let mut index = Self::default();
        for record in records.iter().filter(|r| r.kind == NodeKind::Entity) {
            let name = tokens(&record.context);
            if let Some(first) = name.first().cloned() {
                index
                    .by_first_token
                    .entry(first)
                    .or_default()
                    .push((name, record.hash_id.clone()));
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.by_first_token.is_empty()
    }

    /// Hash ids of matched entities, sorted and deduplicated.
    pub fn matches(&self, query: &str) -> Vec<String> {
        let words = tokens(query);
        let mut hits = Vec::new();
        for (start, word) in words.iter().enumerate() {
            let Some(candidates) = self.by_first_token.get(word) else {
                continue;
            };
            for (name, hash_id) in candidates {
                if words[start..].starts_with(name) {
                    hits.push(hash_id.clone());
                }
            }
        }
        hits.sort();
        hits.dedup();
        hits
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaMatch {
    pub question: String,
    pub answer: String,
    pub score: f32,
}

/// Previously answered questions, searched by question embedding.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QaIndex {
    pairs: Vec<QaPair>,
}

impl QaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec(self)?).await?;
        Ok(())
    }

    pub async fn add(&mut self, embedder: &dyn Embedder, question: &str, answer: &str) -> Result<()> {
        let vector = embedder.embed(question).await?;
        self.pairs.push(QaPair {
            question: question.to_string(),
            answer: answer.to_string(),
            vector,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Up to `k` pairs scoring at least `threshold`, best first.
    pub fn search(&self, vector: &[f32], k: usize, threshold: f32) -> Vec<QaMatch> {
        let mut matches: Vec<QaMatch> = self
            .pairs
            .iter()
            .map(|pair| QaMatch {
                question: pair.question.clone(),
                answer: pair.answer.clone(),
                score: cosine_similarity(vector, &pair.vector),
            })
            .filter(|m| m.score >= threshold)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.question.cmp(&b.question))
        });
        matches.truncate(k);
        matches
    }
}
