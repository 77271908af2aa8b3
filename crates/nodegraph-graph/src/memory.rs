use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use nodegraph_core::error::Result;
use nodegraph_core::graph::{GraphStats, GraphStore, NodeProperties, WeightedEdge};

use crate::graph::KnowledgeGraph;

/// [`GraphStore`] over an in-process [`KnowledgeGraph`].
pub struct MemoryGraphStore {
    graph: KnowledgeGraph,
}

impl MemoryGraphStore {
    pub fn new(graph: KnowledgeGraph) -> Self {
        Self { graph }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(KnowledgeGraph::load(path).await?))
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn neighborhood(&self, seeds: &[String], max_hops: u32) -> Result<Vec<String>> {
        Ok(self.graph.neighborhood(seeds, max_hops))
    }

    async fn edges_among(&self, ids: &[String]) -> Result<Vec<WeightedEdge>> {
        Ok(self.graph.edges_among(ids))
    }

    async fn node_properties(&self, ids: &[String]) -> Result<HashMap<String, NodeProperties>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.graph.node(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }

    async fn stats(&self) -> Result<GraphStats> {
        Ok(self.graph.stats())
    }
}
