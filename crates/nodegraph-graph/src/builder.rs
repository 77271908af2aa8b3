use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use nodegraph_core::config::AppConfig;
use nodegraph_core::entity::{fit_triple, sanitize_field, Entity, Relationship, RelationshipTriple, SemanticUnit};
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::graph::{GraphStats, NodeKind};
use nodegraph_core::hashing::IdAllocator;
use nodegraph_core::llm::{parse_json_reply, LlmRequest, ResponseSchema};
use nodegraph_core::records::{read_jsonl, write_jsonl, NodeRecord, RecordStore, TextUnitRecord};
use nodegraph_extraction::decomposition::{DecomposedUnit, Decomposition, RawRelationship};
use nodegraph_extraction::prompts;
use nodegraph_llm::{CallOutcome, OrchestrationClient};

use crate::graph::KnowledgeGraph;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    /// Decomposed text units waiting for construction at start.
    pub pending: usize,
    pub processed: usize,
    /// Log lines whose stored response is not a decomposition.
    pub unparsable: usize,
    pub failed: usize,
    /// Relationships that went through arity repair.
    pub reconstructed: usize,
    /// Log lines for a text unit that was already applied; marked processed
    /// without touching the graph.
    pub duplicates: usize,
    pub stats: GraphStats,
}

/// Everything the construction stage mutates. Guarded by one lock for the
/// whole build.
#[derive(Default)]
struct BuildState {
    graph: KnowledgeGraph,
    persisted_semantic_units: Vec<NodeRecord>,
    persisted_entities: Vec<NodeRecord>,
    new_semantic_units: Vec<SemanticUnit>,
    new_entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    relationship_index: HashMap<String, usize>,
}

impl BuildState {
    async fn load(graph_path: &Path, records: &dyn RecordStore, ids: &IdAllocator) -> Result<Self> {
        let mut state = BuildState {
            graph: KnowledgeGraph::load(graph_path).await?,
            persisted_semantic_units: records.load(NodeKind::SemanticUnit).await?,
            persisted_entities: records.load(NodeKind::Entity).await?,
            ..Default::default()
        };

        for record in records.load(NodeKind::Relationship).await? {
            match Relationship::from_record(&record) {
                Some(relationship) => {
                    state
                        .relationship_index
                        .insert(relationship.hash_id.clone(), state.relationships.len());
                    state.relationships.push(relationship);
                }
                None => tracing::warn!(hash_id = %record.hash_id, "Relationship record without endpoints"),
            }
        }

        let max_id = |records: &[NodeRecord]| records.iter().map(|r| r.human_readable_id).max();
        if let Some(max) = max_id(&state.persisted_semantic_units) {
            ids.resume_after(NodeKind::SemanticUnit, max);
        }
        if let Some(max) = max_id(&state.persisted_entities) {
            ids.resume_after(NodeKind::Entity, max);
        }
        if let Some(max) = state
            .relationships
            .iter()
            .map(|r| r.human_readable_id(ids))
            .max()
        {
            ids.resume_after(NodeKind::Relationship, max);
        }

        tracing::info!(
            nodes = state.graph.node_count(),
            edges = state.graph.edge_count(),
            relationships = state.relationships.len(),
            "Loaded existing graph state"
        );
        Ok(state)
    }

    fn add_semantic_unit(&mut self, unit: SemanticUnit) -> String {
        let hash_id = unit.hash_id.clone();
        if self.graph.add_node(&hash_id, NodeKind::SemanticUnit) == 1 {
            self.new_semantic_units.push(unit);
        }
        hash_id
    }

    fn add_entity(&mut self, entity: Entity) -> String {
        let hash_id = entity.hash_id.clone();
        if self.graph.add_node(&hash_id, NodeKind::Entity) == 1 {
            self.new_entities.push(entity);
        }
        hash_id
    }

    /// Register a relationship or merge it into an existing one. Returns the
    /// endpoint entities this call created.
    fn add_relationship(&mut self, triple: &RelationshipTriple, text_hash_id: &str) -> Vec<String> {
        let relationship = Relationship::from_triple(triple, text_hash_id);
        if let Some(&index) = self.relationship_index.get(&relationship.hash_id) {
            self.relationships[index].add(triple);
            return Vec::new();
        }

        let mut created = Vec::new();
        for endpoint in [&triple.source, &triple.target] {
            if !self.graph.contains_node(&endpoint.hash_id) {
                self.graph.add_node(&endpoint.hash_id, NodeKind::Entity);
                self.new_entities.push(endpoint.clone());
                created.push(endpoint.hash_id.clone());
            }
        }
        if !self.graph.contains_node(&relationship.hash_id) {
            self.graph.add_node(&relationship.hash_id, NodeKind::Relationship);
        }
        self.graph.add_edge(&triple.source.hash_id, &relationship.hash_id);
        self.graph.add_edge(&relationship.hash_id, &triple.target.hash_id);

        self.relationship_index
            .insert(relationship.hash_id.clone(), self.relationships.len());
        self.relationships.push(relationship);
        created
    }

    fn apply(&mut self, text_hash_id: &str, unit: &DecomposedUnit, triples: &[RelationshipTriple]) {
        let semantic_hash = self.add_semantic_unit(SemanticUnit::new(unit.semantic_unit.as_str(), text_hash_id));

        let mut members: Vec<String> = unit
            .entities
            .iter()
            .map(|name| self.add_entity(Entity::new(name, text_hash_id)))
            .collect();
        for triple in triples {
            members.extend(self.add_relationship(triple, text_hash_id));
        }

        for entity_hash in &members {
            self.graph.add_edge(&semantic_hash, entity_hash);
        }
    }

    fn records(&self, ids: &IdAllocator) -> [(NodeKind, Vec<NodeRecord>); 3] {
        let weight = |hash: &str| self.graph.node_weight(hash).unwrap_or(1);
        let refresh = |records: &[NodeRecord]| -> Vec<NodeRecord> {
            records
                .iter()
                .map(|r| NodeRecord {
                    weight: weight(&r.hash_id),
                    ..r.clone()
                })
                .collect()
        };

        let mut semantic_units = refresh(&self.persisted_semantic_units);
        semantic_units.extend(
            self.new_semantic_units
                .iter()
                .map(|u| u.to_record(ids, weight(&u.hash_id))),
        );

        let mut entities = refresh(&self.persisted_entities);
        entities.extend(
            self.new_entities
                .iter()
                .map(|e| e.to_record(ids, weight(&e.hash_id))),
        );

        let relationships = self
            .relationships
            .iter()
            .map(|r| r.to_record(ids, weight(&r.hash_id)))
            .collect();

        [
            (NodeKind::SemanticUnit, semantic_units),
            (NodeKind::Entity, entities),
            (NodeKind::Relationship, relationships),
        ]
    }

    /// Node counts per kind must match the record counts, and every
    /// relationship must be wired to both endpoints.
    fn check_consistency(&self, records: &[(NodeKind, Vec<NodeRecord>)]) -> Result<()> {
        for (kind, rows) in records {
            let graph_nodes = self.graph.count_kind(*kind);
            if graph_nodes != rows.len() {
                return Err(NodeGraphError::Consistency {
                    kind: *kind,
                    graph_nodes,
                    records: rows.len(),
                });
            }
        }
        for relationship in &self.relationships {
            for endpoint in relationship.endpoints.as_array() {
                if self.graph.edge_weight(endpoint, &relationship.hash_id).is_none() {
                    return Err(NodeGraphError::Graph(format!(
                        "relationship {} is not connected to endpoint {}",
                        relationship.hash_id, endpoint
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Turns decomposition results into graph mutations.
#[derive(Clone)]
pub struct GraphBuilder {
    client: Arc<OrchestrationClient>,
    records: Arc<dyn RecordStore>,
    ids: Arc<IdAllocator>,
    graph_path: PathBuf,
    log_path: PathBuf,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub graph: KnowledgeGraph,
    pub report: BuildReport,
}

impl GraphBuilder {
    pub fn new(
        client: Arc<OrchestrationClient>,
        records: Arc<dyn RecordStore>,
        ids: Arc<IdAllocator>,
        config: &AppConfig,
    ) -> Self {
        Self {
            client,
            records,
            ids,
            graph_path: config.graph_path(),
            log_path: config.decomposition_log_path(),
        }
    }

    /// Build from every unprocessed log line, then persist records, the
    /// graph snapshot and the updated log. Nothing is written when the
    /// completion check fails.
    pub async fn run(&self) -> Result<BuildOutcome> {
        let mut log: Vec<TextUnitRecord> = read_jsonl(&self.log_path).await?;
        let (pending, duplicates) = pending_lines(&log);

        let state = BuildState::load(&self.graph_path, self.records.as_ref(), &self.ids).await?;
        let mut report = BuildReport {
            pending: pending.len(),
            duplicates: duplicates.len(),
            ..Default::default()
        };
        for &index in &duplicates {
            tracing::warn!(text_id = %log[index].text_id, "Text unit already applied, skipping duplicate log line");
            log[index].processed = true;
        }

        if pending.is_empty() {
            if !duplicates.is_empty() {
                write_jsonl(&self.log_path, &log).await?;
            }
            tracing::info!("No decomposed text units waiting for construction");
            report.stats = state.graph.stats();
            return Ok(BuildOutcome {
                graph: state.graph,
                report,
            });
        }

        let state = Arc::new(Mutex::new(state));
        let mut join_set = JoinSet::new();
        for index in pending {
            let builder = self.clone();
            let state = state.clone();
            let record = log[index].clone();
            join_set.spawn(async move { (index, builder.process(&record, &state).await) });
        }

        let total = report.pending;
        let mut completed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            completed += 1;
            match joined {
                Ok((index, Ok(Some(reconstructed)))) => {
                    log[index].processed = true;
                    report.processed += 1;
                    report.reconstructed += reconstructed;
                }
                Ok((index, Ok(None))) => {
                    tracing::warn!(text_id = %log[index].text_id, "Stored response is not a decomposition, leaving unprocessed");
                    report.unparsable += 1;
                }
                Ok((index, Err(e))) => {
                    tracing::error!(text_id = %log[index].text_id, error = %e, "Graph construction failed for text unit");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Graph construction task panicked");
                    report.failed += 1;
                }
            }
            tracing::info!(completed, total, "Graph construction progress");
        }

        let state = Arc::try_unwrap(state)
            .map_err(|_| NodeGraphError::Internal("build state still shared after fan-out".into()))?
            .into_inner();

        let records = state.records(&self.ids);
        state.check_consistency(&records)?;

        for (kind, rows) in &records {
            self.records.overwrite(*kind, rows).await?;
        }
        state.graph.save(&self.graph_path).await?;
        write_jsonl(&self.log_path, &log).await?;

        report.stats = state.graph.stats();
        tracing::info!(
            processed = report.processed,
            nodes = report.stats.nodes,
            edges = report.stats.edges,
            "Semantic units, entities and relationships stored"
        );
        Ok(BuildOutcome {
            graph: state.graph,
            report,
        })
    }

    /// Apply one log line. `Ok(None)` when the stored response does not
    /// parse; otherwise the number of reconstructed relationships.
    async fn process(&self, record: &TextUnitRecord, state: &Mutex<BuildState>) -> Result<Option<usize>> {
        let Some(decomposition) = record.response.as_ref().and_then(Decomposition::from_value) else {
            return Ok(None);
        };

        let mut reconstructed = 0;
        let mut resolved = Vec::with_capacity(decomposition.units.len());
        for unit in &decomposition.units {
            let mut triples = Vec::with_capacity(unit.relationships.len());
            for raw in &unit.relationships {
                let (fields, repaired) = self.resolve_fields(raw).await;
                reconstructed += usize::from(repaired);
                triples.push(RelationshipTriple::new(fields, &record.text_hash_id));
            }
            resolved.push(triples);
        }

        let mut state = state.lock().await;
        for (unit, triples) in decomposition.units.iter().zip(&resolved) {
            state.apply(&record.text_hash_id, unit, triples);
        }
        Ok(Some(reconstructed))
    }

    /// Exactly three fields for a raw relationship; the flag is set when the
    /// arity had to be repaired.
    async fn resolve_fields(&self, raw: &RawRelationship) -> ([String; 3], bool) {
        let fields = raw.fields();
        if fields.len() == 3 {
            return (fit_triple(&fields), false);
        }
        (self.reconstruct(raw, &fields).await, true)
    }

    async fn reconstruct(&self, raw: &RawRelationship, fields: &[String]) -> [String; 3] {
        let request = LlmRequest::structured(
            prompts::relationship_reconstruction(&raw.fragment()),
            ResponseSchema::RelationshipReconstruction,
        );

        let reply = match self.client.call(&request, None, None).await {
            Ok(CallOutcome::Structured(value)) => Some(value),
            Ok(CallOutcome::Raw(text)) => parse_json_reply(&text),
            Ok(CallOutcome::Cached) => None,
            Err(e) => {
                tracing::warn!(fragment = %raw.fragment(), error = %e, "Relationship reconstruction failed");
                None
            }
        };

        match reply.as_ref().and_then(reconstructed_triple) {
            Some(triple) => triple,
            None => {
                tracing::warn!(
                    fragment = %raw.fragment(),
                    fields = fields.len(),
                    "Falling back to truncating or padding the relationship"
                );
                fit_triple(fields)
            }
        }
    }
}

/// Indices of unprocessed log lines to apply, and of unprocessed lines whose
/// text unit is already applied or appears earlier in the pending set.
fn pending_lines(log: &[TextUnitRecord]) -> (Vec<usize>, Vec<usize>) {
    let mut applied: HashSet<&str> = log
        .iter()
        .filter(|record| record.processed)
        .map(|record| record.text_hash_id.as_str())
        .collect();
    let mut pending = Vec::new();
    let mut duplicates = Vec::new();
    for (index, record) in log.iter().enumerate().filter(|(_, r)| !r.processed) {
        if applied.insert(record.text_hash_id.as_str()) {
            pending.push(index);
        } else {
            duplicates.push(index);
        }
    }
    (pending, duplicates)
}

fn reconstructed_triple(value: &Value) -> Option<[String; 3]> {
    let object = value.as_object()?;
    let field = |key: &str| object.get(key).map(sanitize_field).unwrap_or_default();
    Some([field("source"), field("relationship"), field("target")])
}
