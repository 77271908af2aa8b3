use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::instrument;

use nodegraph_core::config::{RankingMode, RetrievalConfig};
use nodegraph_core::error::Result;
use nodegraph_core::graph::{GraphStore, NodeKind, NodeProperties};
use nodegraph_core::llm::{Embedder, VectorIndex};

use crate::index::{EntityNameIndex, QaIndex, QaMatch};
use crate::ppr::{personalized_pagerank, PprParams};

/// Output of one retrieval.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RankedResult {
    pub query: String,
    /// Seeds first, then accepted cross-type nodes, entity attributes and
    /// title-related nodes, in first-seen order.
    pub nodes: Vec<String>,
    /// Accepted relationship nodes, capped and deduplicated.
    pub relationships: Vec<String>,
    /// Entities accepted by the expansion; their attributes are in `nodes`.
    pub entities: Vec<String>,
    pub high_level_titles: Vec<String>,
    /// Kind of every id in `nodes` and `relationships`.
    pub node_types: BTreeMap<String, NodeKind>,
    /// Ranking score of each ranked node.
    pub scores: BTreeMap<String, f64>,
    pub qa_matches: Vec<QaMatch>,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

mod duration_ms {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }
}

/// Per-bucket accumulation while walking the ranked list.
#[derive(Default)]
struct Expansion {
    nodes: Vec<String>,
    seen: HashSet<String>,
    entities: Vec<String>,
    relationships: Vec<String>,
    titles: Vec<String>,
    cross: usize,
    node_types: BTreeMap<String, NodeKind>,
}

impl Expansion {
    fn push(&mut self, id: &str, kind: NodeKind) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.nodes.push(id.to_string());
        self.node_types.entry(id.to_string()).or_insert(kind);
        true
    }
}

/// Seeds from vector and exact-name search, ranks the seeds' neighborhood
/// and expands the ranking into a capped, type-aware result.
pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorIndex>,
    store: Arc<dyn GraphStore>,
    names: EntityNameIndex,
    qa: Option<QaIndex>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        store: Arc<dyn GraphStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            vectors,
            store,
            names: EntityNameIndex::default(),
            qa: None,
            config,
        }
    }

    pub fn with_name_index(mut self, names: EntityNameIndex) -> Self {
        self.names = names;
        self
    }

    pub fn with_qa_index(mut self, qa: QaIndex) -> Self {
        self.qa = Some(qa);
        self
    }

    #[instrument(skip(self), fields(ranking = ?self.config.ranking))]
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RankedResult> {
        let started = Instant::now();

        let query_vector = self.embedder.embed(query).await?;
        let personalization = self.seed(query, &query_vector, top_k).await?;
        let seeds = ordered_seeds(&personalization);
        tracing::debug!(seeds = seeds.len(), "Seed selection complete");

        let ranked = self.rank(&seeds, &personalization).await?;
        let mut result = self.expand(&seeds, &ranked).await?;

        result.query = query.to_string();
        result.scores = ranked.into_iter().collect();
        if let Some(qa) = &self.qa {
            result.qa_matches = qa.search(&query_vector, top_k, self.config.qa_threshold);
        }
        result.latency = started.elapsed();

        tracing::info!(
            nodes = result.nodes.len(),
            relationships = result.relationships.len(),
            qa_matches = result.qa_matches.len(),
            latency_ms = result.latency.as_millis() as u64,
            "Retrieval complete"
        );
        Ok(result)
    }

    /// Personalization weights: vector hits scaled by similarity, plus a
    /// fixed bonus for exact entity-name matches.
    async fn seed(&self, query: &str, vector: &[f32], top_k: usize) -> Result<HashMap<String, f64>> {
        let mut personalization: HashMap<String, f64> = HashMap::new();
        for (id, score) in self.vectors.query_top_k(vector, top_k).await? {
            *personalization.entry(id).or_insert(0.0) +=
                self.config.similarity_weight * f64::from(score.max(0.0));
        }
        for id in self.names.matches(query) {
            *personalization.entry(id).or_insert(0.0) += self.config.accuracy_weight;
        }
        personalization.retain(|_, w| *w > 0.0);
        Ok(personalization)
    }

    async fn rank(&self, seeds: &[String], personalization: &HashMap<String, f64>) -> Result<Vec<(String, f64)>> {
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        if self.config.ranking == RankingMode::StoreNative {
            if let Some(scores) = self.store.native_scores(personalization).await? {
                return Ok(scores);
            }
            tracing::debug!("Store has no native scoring, ranking locally");
        }

        let nodes = self.store.neighborhood(seeds, self.config.max_hops).await?;
        let edges = self.store.edges_among(&nodes).await?;
        Ok(personalized_pagerank(
            &nodes,
            &edges,
            personalization,
            PprParams {
                damping: self.config.damping,
                max_iterations: self.config.max_iterations,
                tolerance: self.config.tolerance,
            },
        ))
    }

    async fn expand(&self, seeds: &[String], ranked: &[(String, f64)]) -> Result<RankedResult> {
        let ids: Vec<String> = seeds
            .iter()
            .cloned()
            .chain(ranked.iter().map(|(id, _)| id.clone()))
            .collect();
        let props = self.store.node_properties(&ids).await?;
        let kind_of = |id: &str| props.get(id).map(|p| p.kind);

        let mut exp = Expansion::default();
        for seed in seeds {
            exp.push(seed, kind_of(seed).unwrap_or(NodeKind::Unknown));
        }

        let cfg = &self.config;
        for (id, _) in ranked {
            if exp.seen.contains(id) {
                continue;
            }
            match kind_of(id) {
                Some(NodeKind::Entity) => {
                    if exp.entities.len() < cfg.entity_cap && !exp.entities.contains(id) {
                        exp.entities.push(id.clone());
                    }
                }
                Some(NodeKind::Relationship) => {
                    if exp.relationships.len() < cfg.relationship_cap && !exp.relationships.contains(id) {
                        exp.relationships.push(id.clone());
                    }
                }
                Some(NodeKind::HighLevelElementTitle) => {
                    if exp.titles.len() < cfg.high_level_cap && !exp.titles.contains(id) {
                        exp.titles.push(id.clone());
                    }
                }
                other => {
                    if exp.cross < cfg.cross_cap && exp.push(id, other.unwrap_or(NodeKind::Unknown)) {
                        exp.cross += 1;
                    }
                }
            }

            if exp.cross >= cfg.cross_cap
                && exp.entities.len() >= cfg.entity_cap
                && exp.relationships.len() >= cfg.relationship_cap
                && exp.titles.len() >= cfg.high_level_cap
            {
                break;
            }
        }

        self.pull_linked(&mut exp, &props).await?;

        for rel in &exp.relationships {
            exp.node_types
                .entry(rel.clone())
                .or_insert_with(|| kind_of(rel).unwrap_or(NodeKind::Relationship));
        }

        Ok(RankedResult {
            query: String::new(),
            nodes: exp.nodes,
            relationships: exp.relationships,
            entities: exp.entities,
            high_level_titles: exp.titles,
            node_types: exp.node_types,
            scores: BTreeMap::new(),
            qa_matches: Vec::new(),
            latency: Duration::ZERO,
        })
    }

    /// Append attributes of accepted entities and the related node of each
    /// accepted title. Nodes unknown to the store get a sentinel kind.
    async fn pull_linked(&self, exp: &mut Expansion, props: &HashMap<String, NodeProperties>) -> Result<()> {
        let attributes: Vec<String> = exp
            .entities
            .iter()
            .filter_map(|e| props.get(e))
            .flat_map(|p| p.attributes.iter().cloned())
            .collect();
        let related: Vec<String> = exp
            .titles
            .iter()
            .filter_map(|t| props.get(t))
            .filter_map(|p| p.related_node.clone())
            .collect();
        if attributes.is_empty() && related.is_empty() {
            return Ok(());
        }

        let linked_ids: Vec<String> = attributes.iter().chain(&related).cloned().collect();
        let linked = self.store.node_properties(&linked_ids).await?;
        let kind = |id: &str, sentinel: NodeKind| linked.get(id).map_or(sentinel, |p| p.kind);

        for attribute in &attributes {
            exp.push(attribute, kind(attribute, NodeKind::Attribute));
        }
        for node in &related {
            exp.push(node, kind(node, NodeKind::HighLevelElement));
        }
        Ok(())
    }
}

/// Seeds by descending weight, ties by id.
fn ordered_seeds(personalization: &HashMap<String, f64>) -> Vec<String> {
    let mut seeds: Vec<(&String, &f64)> = personalization.iter().collect();
    seeds.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
    seeds.into_iter().map(|(id, _)| id.clone()).collect()
}
