mod common;

use std::sync::Arc;

use nodegraph_core::config::{RankingMode, RetrievalConfig};
use nodegraph_core::graph::NodeKind;
use nodegraph_core::records::NodeRecord;
use nodegraph_graph::MemoryGraphStore;
use nodegraph_retrieval::{EmbeddingIndexer, EntityNameIndex, FlatVectorIndex, QaIndex, RetrievalEngine};

use common::{decomposition, ScriptedBackend, TokenEmbedder, Workspace};

struct Built {
    ws: Workspace,
    store: Arc<MemoryGraphStore>,
    entities: Vec<NodeRecord>,
    relationships: Vec<NodeRecord>,
}

async fn built_graph() -> Built {
    let ws = Workspace::new();
    ws.write_sources(&[
        ("doc#0", "Alice manages Bob at Acme"),
        ("doc#1", "Carol hired Dave"),
    ])
    .await;
    let backend = ScriptedBackend::new()
        .on(
            "Alice manages Bob at Acme",
            decomposition("Alice manages Bob", &["Alice", "Bob"], &["Alice, manages, Bob"]),
        )
        .on(
            "Carol hired Dave",
            decomposition("Carol hired Dave", &["Carol", "Dave"], &["Carol, hired, Dave"]),
        );
    let (_, outcome) = ws.build(Arc::new(backend)).await;

    Built {
        store: Arc::new(MemoryGraphStore::new(outcome.graph)),
        entities: ws.records(NodeKind::Entity).await,
        relationships: ws.records(NodeKind::Relationship).await,
        ws,
    }
}

async fn engine(built: &Built, config: RetrievalConfig) -> RetrievalEngine {
    let embedder = TokenEmbedder;
    let vectors = FlatVectorIndex::new();
    EmbeddingIndexer::new(&embedder, &vectors)
        .index_records(&built.entities)
        .await
        .unwrap();
    RetrievalEngine::new(Arc::new(TokenEmbedder), Arc::new(vectors), built.store.clone(), config)
        .with_name_index(EntityNameIndex::from_records(&built.entities))
}

fn hash_of(records: &[NodeRecord], context: &str) -> String {
    records
        .iter()
        .find(|r| r.context == context)
        .map(|r| r.hash_id.clone())
        .unwrap_or_else(|| panic!("no record for {context}"))
}

// ---------------------------------------------------------------------------
// Ranking over a built graph
// ---------------------------------------------------------------------------

#[tokio::test]
async fn named_entity_leads_and_pulls_its_relationship() {
    let built = built_graph().await;
    let engine = engine(&built, RetrievalConfig::default()).await;

    let result = engine.retrieve("What does Alice do?", 5).await.unwrap();

    let alice = hash_of(&built.entities, "ALICE");
    let manages = hash_of(&built.relationships, "Alice manages Bob");
    assert_eq!(result.nodes.first(), Some(&alice));
    assert_eq!(result.node_types.get(&alice), Some(&NodeKind::Entity));
    assert!(result.relationships.contains(&manages));
    assert_eq!(result.node_types.get(&manages), Some(&NodeKind::Relationship));
    assert!(result.scores.get(&alice).copied().unwrap_or_default() > 0.0);
}

#[tokio::test]
async fn retrieval_is_deterministic() {
    let built = built_graph().await;
    let engine = engine(&built, RetrievalConfig::default()).await;

    let first = engine.retrieve("Who did Carol hire?", 5).await.unwrap();
    let second = engine.retrieve("Who did Carol hire?", 5).await.unwrap();

    assert_eq!(first.nodes, second.nodes);
    assert_eq!(first.relationships, second.relationships);
    assert_eq!(first.entities, second.entities);
    assert_eq!(first.scores, second.scores);
}

#[tokio::test]
async fn native_ranking_falls_back_on_a_local_store() {
    let built = built_graph().await;
    let local = engine(&built, RetrievalConfig::default()).await;
    let native = engine(
        &built,
        RetrievalConfig {
            ranking: RankingMode::StoreNative,
            ..RetrievalConfig::default()
        },
    )
    .await;

    let a = local.retrieve("Alice", 5).await.unwrap();
    let b = native.retrieve("Alice", 5).await.unwrap();

    assert_eq!(a.nodes, b.nodes);
    assert_eq!(a.scores, b.scores);
}

#[tokio::test]
async fn query_without_any_seed_returns_nothing() {
    let built = built_graph().await;
    let engine = engine(&built, RetrievalConfig::default()).await;

    let result = engine.retrieve("", 5).await.unwrap();

    assert!(result.nodes.is_empty());
    assert!(result.relationships.is_empty());
    assert!(result.scores.is_empty());
}

// ---------------------------------------------------------------------------
// Persisted indexes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saved_vector_index_serves_the_same_results() {
    let built = built_graph().await;
    let fresh = engine(&built, RetrievalConfig::default()).await;

    let path = built.ws.config.vector_index_path();
    let vectors = FlatVectorIndex::new();
    EmbeddingIndexer::new(&TokenEmbedder, &vectors)
        .with_batch_size(1)
        .index_records(&built.entities)
        .await
        .unwrap();
    vectors.save(&path).await.unwrap();
    let reloaded = RetrievalEngine::new(
        Arc::new(TokenEmbedder),
        Arc::new(FlatVectorIndex::load(&path).await.unwrap()),
        built.store.clone(),
        RetrievalConfig::default(),
    )
    .with_name_index(EntityNameIndex::from_records(&built.entities));

    let a = fresh.retrieve("Bob at Acme", 5).await.unwrap();
    let b = reloaded.retrieve("Bob at Acme", 5).await.unwrap();
    assert_eq!(a.nodes, b.nodes);
    assert_eq!(a.scores, b.scores);
}

#[tokio::test]
async fn answered_question_is_surfaced_from_the_qa_index() {
    let built = built_graph().await;
    let embedder = TokenEmbedder;
    let mut qa = QaIndex::new();
    qa.add(&embedder, "Who manages Bob?", "Alice").await.unwrap();
    qa.add(&embedder, "Where is the harbour?", "North").await.unwrap();
    let path = built.ws.config.qa_index_path();
    qa.save(&path).await.unwrap();

    let engine = engine(&built, RetrievalConfig::default())
        .await
        .with_qa_index(QaIndex::load(&path).await.unwrap());
    let result = engine.retrieve("Who manages Bob?", 5).await.unwrap();

    assert_eq!(result.qa_matches.len(), 1);
    assert_eq!(result.qa_matches[0].answer, "Alice");
}
