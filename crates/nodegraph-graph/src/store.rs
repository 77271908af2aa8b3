use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use neo4rs::{query, Graph, Query};

use nodegraph_core::config::Neo4jConfig;
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::graph::{GraphStats, GraphStore, NodeKind, NodeProperties, WeightedEdge};

use crate::graph::KnowledgeGraph;

/// Nodes or edges written per UNWIND statement.
const WRITE_BATCH: usize = 1000;

/// Hop radius of the store-native neighbor scoring.
const NATIVE_SCORE_HOPS: u32 = 2;

/// Graph mirror in Neo4j: every node is a `Node` with `id`, `type` and
/// `weight` properties, every edge a `CONNECTED_TO` relationship carrying
/// `weight`. Direction is not meaningful; all reads match undirected.
pub struct Neo4jGraphStore {
    graph: Option<Graph>,
    statement_timeout: Duration,
}

impl Neo4jGraphStore {
    /// Attach to the mirror. An unreachable server yields a detached store;
    /// retrieval then runs on the local snapshot alone.
    pub async fn new(config: &Neo4jConfig) -> Self {
        let statement_timeout = Duration::from_secs(config.timeout_secs);
        let graph = match Graph::new(&config.uri, &config.user, &config.password).await {
            Ok(graph) => {
                tracing::info!(uri = %config.uri, "Graph mirror attached");
                Some(graph)
            }
            Err(e) => {
                tracing::warn!(
                    uri = %config.uri,
                    error = %e,
                    "Graph mirror unreachable, using the local snapshot only"
                );
                None
            }
        };
        Self { graph, statement_timeout }
    }

    pub fn is_connected(&self) -> bool {
        self.graph.is_some()
    }

    fn attached(&self, what: &str) -> Result<&Graph> {
        self.graph
            .as_ref()
            .ok_or_else(|| NodeGraphError::Graph(format!("cannot {what}: graph mirror is detached")))
    }

    /// Await one mirror statement under the configured timeout.
    async fn bounded<T, E: Display>(
        &self,
        what: &str,
        op: impl Future<Output = std::result::Result<T, E>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.statement_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(NodeGraphError::Graph(format!("Failed to {what}: {e}"))),
            Err(_) => {
                tracing::warn!(
                    operation = what,
                    timeout_ms = self.statement_timeout.as_millis() as u64,
                    "Graph mirror statement timed out"
                );
                Err(NodeGraphError::Graph(format!(
                    "{what} did not finish within {:?}",
                    self.statement_timeout
                )))
            }
        }
    }

    async fn run(&self, q: Query, what: &str) -> Result<()> {
        self.bounded(what, self.attached(what)?.run(q)).await
    }

    /// Replace the database contents with `graph`.
    pub async fn save_graph(&self, graph: &KnowledgeGraph) -> Result<()> {
        self.run(query("MATCH (n:Node) DETACH DELETE n"), "clear database")
            .await?;

        let nodes: Vec<(&str, &NodeProperties)> = graph.nodes().collect();
        for batch in nodes.chunks(WRITE_BATCH) {
            let q = query(
                "UNWIND range(0, size($ids) - 1) AS i \
                 CREATE (n:Node {id: $ids[i]}) \
                 SET n.type = $types[i], n.weight = $weights[i], \
                     n.attributes = $attributes[i], n.related_node = $related[i]",
            )
            .param("ids", batch.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>())
            .param("types", batch.iter().map(|(_, p)| p.kind.as_str().to_string()).collect::<Vec<_>>())
            .param("weights", batch.iter().map(|(_, p)| p.weight as i64).collect::<Vec<_>>())
            .param("attributes", batch.iter().map(|(_, p)| p.attributes.clone()).collect::<Vec<_>>())
            .param(
                "related",
                batch
                    .iter()
                    .map(|(_, p)| p.related_node.clone().unwrap_or_default())
                    .collect::<Vec<_>>(),
            );
            self.run(q, "create nodes").await?;
        }

        let edges: Vec<WeightedEdge> = graph.edges().collect();
        for batch in edges.chunks(WRITE_BATCH) {
            let q = query(
                "UNWIND range(0, size($sources) - 1) AS i \
                 MATCH (source:Node {id: $sources[i]}) \
                 MATCH (target:Node {id: $targets[i]}) \
                 CREATE (source)-[r:CONNECTED_TO]->(target) \
                 SET r.weight = $weights[i]",
            )
            .param("sources", batch.iter().map(|e| e.source.clone()).collect::<Vec<_>>())
            .param("targets", batch.iter().map(|e| e.target.clone()).collect::<Vec<_>>())
            .param("weights", batch.iter().map(|e| e.weight as i64).collect::<Vec<_>>());
            self.run(q, "create relationships").await?;
        }

        for statement in [
            "CREATE INDEX node_id_index IF NOT EXISTS FOR (n:Node) ON (n.id)",
            "CREATE INDEX node_type_index IF NOT EXISTS FOR (n:Node) ON (n.type)",
        ] {
            if let Err(e) = self.run(query(statement), "create index").await {
                tracing::warn!(error = %e, "Could not create index");
            }
        }

        tracing::info!(
            nodes = nodes.len(),
            edges = edges.len(),
            "Graph stored in Neo4j"
        );
        Ok(())
    }

    /// Read the whole mirror back into memory.
    pub async fn load_graph(&self) -> Result<KnowledgeGraph> {
        let mut graph = KnowledgeGraph::new();

        let nodes = query(
            "MATCH (n:Node) RETURN n.id AS id, n.type AS type, n.weight AS weight, \
             n.attributes AS attributes, n.related_node AS related_node",
        );
        let mut stream = self.bounded("load nodes", self.attached("load nodes")?.execute(nodes)).await?;
        while let Ok(Some(row)) = stream.next().await {
            let Ok(id) = row.get::<String>("id") else {
                tracing::warn!("Skipping node without id");
                continue;
            };
            graph.insert_node(&id, row_properties(&row));
        }

        let edges = query(
            "MATCH (a:Node)-[r:CONNECTED_TO]->(b:Node) \
             RETURN a.id AS source, b.id AS target, r.weight AS weight",
        );
        let mut stream = self.bounded("load edges", self.attached("load edges")?.execute(edges)).await?;
        while let Ok(Some(row)) = stream.next().await {
            if let (Ok(source), Ok(target)) = (row.get::<String>("source"), row.get::<String>("target")) {
                let weight = row.get::<i64>("weight").unwrap_or(1).max(1) as u64;
                graph.insert_edge(&source, &target, weight);
            }
        }

        tracing::info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Loaded graph from Neo4j"
        );
        Ok(graph)
    }

    async fn count(&self, cypher: &str) -> Result<u64> {
        let mut stream = self.bounded("count", self.attached("count")?.execute(query(cypher))).await?;
        match stream.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get("cnt")
                    .map_err(|e| NodeGraphError::Graph(format!("Failed to get count: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(NodeGraphError::Graph(format!("Error counting: {e}"))),
        }
    }
}

fn row_properties(row: &neo4rs::Row) -> NodeProperties {
    let kind = row
        .get::<String>("type")
        .map(|t| NodeKind::parse(&t))
        .unwrap_or(NodeKind::Unknown);
    let weight = row.get::<i64>("weight").unwrap_or(1).max(1) as u64;
    NodeProperties {
        kind,
        weight,
        attributes: row.get::<Vec<String>>("attributes").unwrap_or_default(),
        related_node: row
            .get::<String>("related_node")
            .ok()
            .filter(|s| !s.is_empty()),
    }
}

/// Rank by seed connections over degree, best first, ties by id.
fn order_native_scores(mut scores: Vec<(String, f64)>) -> Vec<(String, f64)> {
    scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scores
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn neighborhood(&self, seeds: &[String], max_hops: u32) -> Result<Vec<String>> {
        let cypher = if max_hops == 0 {
            "UNWIND $seeds AS seed_id MATCH (n:Node {id: seed_id}) RETURN DISTINCT n.id AS id"
                .to_string()
        } else {
            format!(
                "UNWIND $seeds AS seed_id \
                 MATCH (start:Node {{id: seed_id}}) \
                 OPTIONAL MATCH (start)-[:CONNECTED_TO*1..{max_hops}]-(connected:Node) \
                 WITH collect(DISTINCT start.id) + collect(DISTINCT connected.id) AS ids \
                 UNWIND ids AS id \
                 RETURN DISTINCT id"
            )
        };
        let q = query(&cypher).param("seeds", seeds.to_vec());

        let mut stream = self.bounded("expand neighborhood", self.attached("expand neighborhood")?.execute(q)).await?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            if let Ok(id) = row.get::<String>("id") {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();

        tracing::debug!(seeds = seeds.len(), max_hops, nodes = ids.len(), "Fetched neighborhood");
        Ok(ids)
    }

    async fn edges_among(&self, ids: &[String]) -> Result<Vec<WeightedEdge>> {
        let q = query(
            "MATCH (a:Node)-[r:CONNECTED_TO]->(b:Node) \
             WHERE a.id IN $ids AND b.id IN $ids \
             RETURN a.id AS source, b.id AS target, r.weight AS weight",
        )
        .param("ids", ids.to_vec());

        let mut stream = self.bounded("fetch edges", self.attached("fetch edges")?.execute(q)).await?;

        let mut merged: BTreeMap<(String, String), u64> = BTreeMap::new();
        while let Ok(Some(row)) = stream.next().await {
            let (Ok(source), Ok(target)) = (row.get::<String>("source"), row.get::<String>("target")) else {
                continue;
            };
            let weight = row.get::<i64>("weight").unwrap_or(1).max(1) as u64;
            let key = if source <= target { (source, target) } else { (target, source) };
            *merged.entry(key).or_insert(0) += weight;
        }

        Ok(merged
            .into_iter()
            .map(|((source, target), weight)| WeightedEdge { source, target, weight })
            .collect())
    }

    async fn node_properties(&self, ids: &[String]) -> Result<HashMap<String, NodeProperties>> {
        let q = query(
            "UNWIND $ids AS node_id \
             MATCH (n:Node {id: node_id}) \
             RETURN n.id AS id, n.type AS type, n.weight AS weight, \
                    n.attributes AS attributes, n.related_node AS related_node",
        )
        .param("ids", ids.to_vec());

        let mut stream = self.bounded("fetch node properties", self.attached("fetch node properties")?.execute(q)).await?;

        let mut out = HashMap::new();
        while let Ok(Some(row)) = stream.next().await {
            if let Ok(id) = row.get::<String>("id") {
                out.insert(id, row_properties(&row));
            }
        }
        Ok(out)
    }

    async fn native_scores(
        &self,
        personalization: &HashMap<String, f64>,
    ) -> Result<Option<Vec<(String, f64)>>> {
        if personalization.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let mut seeds: Vec<String> = personalization.keys().cloned().collect();
        seeds.sort();

        let cypher = format!(
            "UNWIND $seeds AS seed_id \
             MATCH (seed:Node {{id: seed_id}})-[:CONNECTED_TO*1..{NATIVE_SCORE_HOPS}]-(connected:Node) \
             WITH connected, count(DISTINCT seed) AS seed_connections \
             MATCH (connected)-[:CONNECTED_TO]-(neighbor:Node) \
             WITH connected, seed_connections, count(DISTINCT neighbor) AS total_degree \
             RETURN connected.id AS id, (seed_connections * 1.0 / (total_degree + 1)) AS score"
        );
        let q = query(&cypher).param("seeds", seeds);

        let mut stream = self.bounded("score neighbors", self.attached("score neighbors")?.execute(q)).await?;

        let mut scores = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            if let (Ok(id), Ok(score)) = (row.get::<String>("id"), row.get::<f64>("score")) {
                scores.push((id, score));
            }
        }
        Ok(Some(order_native_scores(scores)))
    }

    async fn stats(&self) -> Result<GraphStats> {
        let nodes = self.count("MATCH (n:Node) RETURN count(n) AS cnt").await?;
        let edges = self
            .count("MATCH ()-[r:CONNECTED_TO]->() RETURN count(r) AS cnt")
            .await?;

        let mut stream = self
            .bounded(
                "count node types",
                self.attached("count node types")?
                    .execute(query("MATCH (n:Node) RETURN n.type AS type, count(n) AS cnt")),
            )
            .await?;

        let mut by_kind = BTreeMap::new();
        while let Ok(Some(row)) = stream.next().await {
            let kind = row
                .get::<String>("type")
                .map(|t| NodeKind::parse(&t))
                .unwrap_or(NodeKind::Unknown);
            let count = row.get::<i64>("cnt").unwrap_or(0).max(0) as u64;
            *by_kind.entry(kind).or_insert(0) += count;
        }

        Ok(GraphStats {
            nodes,
            edges,
            by_kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_scores_order_is_deterministic() {
        let ordered = order_native_scores(vec![
            ("b".into(), 0.5),
            ("c".into(), 1.0),
            ("a".into(), 0.5),
        ]);
        let ids: Vec<&str> = ordered.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    fn detached(statement_timeout: Duration) -> Neo4jGraphStore {
        Neo4jGraphStore {
            graph: None,
            statement_timeout,
        }
    }

    #[tokio::test]
    async fn test_detached_store_names_the_failed_operation() {
        let store = detached(Duration::from_secs(5));
        assert!(!store.is_connected());
        let err = store.stats().await.unwrap_err();
        match err {
            NodeGraphError::Graph(msg) => {
                assert!(msg.contains("count"), "{msg}");
                assert!(msg.contains("detached"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_statement_hits_the_configured_timeout() {
        let store = detached(Duration::from_millis(20));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        };
        let err = store.bounded("clear database", slow).await.unwrap_err();
        match err {
            NodeGraphError::Graph(msg) => assert!(msg.starts_with("clear database did not finish"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_statement_error_carries_the_operation() {
        let store = detached(Duration::from_secs(5));
        let failing = async { Err::<(), _>("connection reset") };
        let err = store.bounded("create nodes", failing).await.unwrap_err();
        assert!(matches!(err, NodeGraphError::Graph(msg) if msg == "Failed to create nodes: connection reset"));
    }
}
