use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use nodegraph_core::config::AppConfig;
use nodegraph_core::error::Result;
use nodegraph_core::graph::{GraphStore, NodeKind};
use nodegraph_core::hashing::IdAllocator;
use nodegraph_core::llm::Embedder;
use nodegraph_core::records::{NodeRecord, RecordStore};
use nodegraph_extraction::TextDecomposer;
use nodegraph_graph::{GraphBuilder, JsonlRecordStore, KnowledgeGraph, MemoryGraphStore, Neo4jGraphStore};
use nodegraph_llm::{build_backend, OpenAiEmbedder, OrchestrationClient};
use nodegraph_retrieval::{EmbeddingIndexer, EntityNameIndex, FlatVectorIndex, QaIndex, RetrievalEngine};

/// Decompose (or replay the failure cache first when `rerun`), construct,
/// persist, and mirror into Neo4j when enabled.
#[tracing::instrument(skip(config), fields(run_id = %Uuid::new_v4()))]
pub async fn build(config: &AppConfig, rerun: bool) -> Result<()> {
    let client = Arc::new(OrchestrationClient::new(
        build_backend(&config.llm),
        &config.orchestration,
    ));

    let decomposer = TextDecomposer::new(client.clone(), config);
    let report = if rerun {
        decomposer.rerun().await?
    } else {
        decomposer.run().await?
    };
    tracing::info!(
        total = report.total,
        decomposed = report.decomposed,
        replayed = report.replayed,
        "Text pipeline finished"
    );

    let records: Arc<dyn RecordStore> = Arc::new(JsonlRecordStore::new(config.records_dir()));
    let builder = GraphBuilder::new(client.clone(), records, Arc::new(IdAllocator::new()), config);
    let outcome = builder.run().await?;
    tracing::info!(
        processed = outcome.report.processed,
        reconstructed = outcome.report.reconstructed,
        llm_calls = client.dispatched(),
        "Graph pipeline finished"
    );

    if config.neo4j.enabled && outcome.report.processed > 0 {
        mirror(config, &outcome.graph).await;
    }
    Ok(())
}

async fn mirror(config: &AppConfig, graph: &KnowledgeGraph) {
    let store = Neo4jGraphStore::new(&config.neo4j).await;
    if !store.is_connected() {
        tracing::warn!("Neo4j unavailable, graph kept in the local snapshot only");
        return;
    }
    if let Err(e) = store.save_graph(graph).await {
        tracing::warn!(error = %e, "Failed to save to Neo4j, graph kept in the local snapshot only");
    }
}

pub async fn index(config: &AppConfig) -> Result<()> {
    let records = JsonlRecordStore::new(config.records_dir());
    let entities = records.load(NodeKind::Entity).await?;

    let path = config.vector_index_path();
    let vectors = FlatVectorIndex::load(&path).await?;
    let mut missing = Vec::new();
    for record in entities {
        if !vectors.contains(&record.hash_id).await {
            missing.push(record);
        }
    }

    let embedder = OpenAiEmbedder::new(&config.llm);
    let inserted = EmbeddingIndexer::new(&embedder, &vectors)
        .index_records(&missing)
        .await?;
    vectors.save(&path).await?;
    tracing::info!(inserted, path = %path.display(), "Vector index updated");
    Ok(())
}

/// The Neo4j store when enabled and reachable, else the local snapshot.
async fn graph_store(config: &AppConfig) -> Result<Arc<dyn GraphStore>> {
    if config.neo4j.enabled {
        let store = Neo4jGraphStore::new(&config.neo4j).await;
        if store.is_connected() {
            return Ok(Arc::new(store));
        }
        tracing::warn!("Neo4j unavailable, using the local graph snapshot");
    }
    Ok(Arc::new(MemoryGraphStore::load(&config.graph_path()).await?))
}

pub async fn search(config: &AppConfig, query: &str, top_k: usize, json: bool) -> Result<()> {
    let records = JsonlRecordStore::new(config.records_dir());
    let mut contexts: HashMap<String, NodeRecord> = HashMap::new();
    let mut entities = Vec::new();
    for kind in NodeKind::BUILT {
        for record in records.load(kind).await? {
            if kind == NodeKind::Entity {
                entities.push(record.clone());
            }
            contexts.insert(record.hash_id.clone(), record);
        }
    }

    let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(&config.llm));
    let vectors = Arc::new(FlatVectorIndex::load(&config.vector_index_path()).await?);
    let engine = RetrievalEngine::new(embedder, vectors, graph_store(config).await?, config.retrieval.clone())
        .with_name_index(EntityNameIndex::from_records(&entities))
        .with_qa_index(QaIndex::load(&config.qa_index_path()).await?);

    let result = engine.retrieve(query, top_k).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Query: {}", result.query);
    println!("Nodes ({}):", result.nodes.len());
    for id in &result.nodes {
        let kind = result.node_types.get(id).copied().unwrap_or(NodeKind::Unknown);
        println!("  [{kind}] {} {}", short_id(id), context(&contexts, id));
    }
    println!("Relationships ({}):", result.relationships.len());
    for id in &result.relationships {
        println!("  {}", context(&contexts, id).replace('\t', " | "));
    }
    for qa in &result.qa_matches {
        println!("QA ({:.2}): {} -> {}", qa.score, qa.question, qa.answer);
    }
    println!("Latency: {:.1} ms", result.latency.as_secs_f64() * 1000.0);
    Ok(())
}

pub async fn remember(config: &AppConfig, question: &str, answer: &str) -> Result<()> {
    let path = config.qa_index_path();
    let mut qa = QaIndex::load(&path).await?;
    qa.add(&OpenAiEmbedder::new(&config.llm), question, answer).await?;
    qa.save(&path).await?;
    tracing::info!(pairs = qa.len(), "Question stored");
    Ok(())
}

pub async fn stats(config: &AppConfig, json: bool) -> Result<()> {
    let stats = graph_store(config).await?.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Nodes: {}", stats.nodes);
    println!("Edges: {}", stats.edges);
    for (kind, count) in &stats.by_kind {
        println!("  {kind}: {count}");
    }
    Ok(())
}

fn context<'a>(contexts: &'a HashMap<String, NodeRecord>, id: &str) -> &'a str {
    contexts.get(id).map(|r| r.context.as_str()).unwrap_or("")
}

/// First eight characters of a hash id.
fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
