use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use nodegraph_core::error::Result;
use nodegraph_core::graph::{GraphStats, NodeKind, NodeProperties, WeightedEdge};

/// Undirected edge key, endpoints stored sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey(String, String);

impl EdgeKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

/// Undirected weighted graph keyed by node hash id.
///
/// Nodes and edges live in flat maps; adjacency is derived and rebuilt on
/// load. Adding an existing node or edge increments its weight.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    nodes: BTreeMap<String, NodeProperties>,
    edges: BTreeMap<EdgeKey, u64>,
    adjacency: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotNode {
    id: String,
    #[serde(flatten)]
    properties: NodeProperties,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    nodes: Vec<SnapshotNode>,
    edges: Vec<WeightedEdge>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the node with weight 1 or increment it. Returns the new weight.
    pub fn add_node(&mut self, id: &str, kind: NodeKind) -> u64 {
        let props = self
            .nodes
            .entry(id.to_string())
            .and_modify(|p| p.weight += 1)
            .or_insert_with(|| NodeProperties::new(kind, 1));
        props.weight
    }

    /// Create the edge with weight 1 or increment it. Returns the new weight.
    pub fn add_edge(&mut self, a: &str, b: &str) -> u64 {
        self.insert_edge(a, b, 1)
    }

    /// Insert or replace a node with explicit properties.
    pub fn insert_node(&mut self, id: &str, properties: NodeProperties) {
        self.nodes.insert(id.to_string(), properties);
    }

    /// Add `weight` to the edge, creating it if absent. Returns the new weight.
    pub fn insert_edge(&mut self, a: &str, b: &str, weight: u64) -> u64 {
        let total = self.edges.entry(EdgeKey::new(a, b)).or_insert(0);
        *total += weight;
        let total = *total;
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
        total
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&NodeProperties> {
        self.nodes.get(id)
    }

    pub fn node_weight(&self, id: &str) -> Option<u64> {
        self.nodes.get(id).map(|p| p.weight)
    }

    pub fn edge_weight(&self, a: &str, b: &str) -> Option<u64> {
        self.edges.get(&EdgeKey::new(a, b)).copied()
    }

    /// Neighbors of `id` in ascending id order.
    pub fn neighbors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn degree(&self, id: &str) -> usize {
        self.adjacency.get(id).map_or(0, BTreeSet::len)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeProperties)> {
        self.nodes.iter().map(|(id, p)| (id.as_str(), p))
    }

    pub fn edges(&self) -> impl Iterator<Item = WeightedEdge> + '_ {
        self.edges.iter().map(|(key, weight)| WeightedEdge {
            source: key.0.clone(),
            target: key.1.clone(),
            weight: *weight,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn count_kind(&self, kind: NodeKind) -> usize {
        self.nodes.values().filter(|p| p.kind == kind).count()
    }

    pub fn stats(&self) -> GraphStats {
        let mut by_kind = BTreeMap::new();
        for props in self.nodes.values() {
            *by_kind.entry(props.kind).or_insert(0) += 1;
        }
        GraphStats {
            nodes: self.nodes.len() as u64,
            edges: self.edges.len() as u64,
            by_kind,
        }
    }

    /// Ids within `max_hops` of any seed, seeds included, sorted. Seeds not
    /// in the graph are ignored.
    pub fn neighborhood(&self, seeds: &[String], max_hops: u32) -> Vec<String> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<(&str, u32)> = VecDeque::new();
        for seed in seeds {
            if let Some((id, _)) = self.nodes.get_key_value(seed.as_str()) {
                if seen.insert(id.as_str()) {
                    queue.push_back((id.as_str(), 0));
                }
            }
        }
        while let Some((id, depth)) = queue.pop_front() {
            if depth == max_hops {
                continue;
            }
            for next in self.neighbors(id) {
                if seen.insert(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        seen.into_iter().map(str::to_string).collect()
    }

    /// Edges with both endpoints in `ids`.
    pub fn edges_among(&self, ids: &[String]) -> Vec<WeightedEdge> {
        let members: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let mut out = Vec::new();
        for id in &members {
            for next in self.neighbors(id) {
                if *id < next && members.contains(next) {
                    if let Some(weight) = self.edge_weight(id, next) {
                        out.push(WeightedEdge {
                            source: id.to_string(),
                            target: next.to_string(),
                            weight,
                        });
                    }
                }
            }
        }
        out
    }

    /// Load a JSON snapshot. A missing file is an empty graph.
    pub async fn load(path: &Path) -> Result<Self> {
        let body = match tokio::fs::read_to_string(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&body)?;

        let mut graph = Self::new();
        for node in snapshot.nodes {
            graph.insert_node(&node.id, node.properties);
        }
        for edge in snapshot.edges {
            graph.insert_edge(&edge.source, &edge.target, edge.weight);
        }
        tracing::debug!(
            path = %path.display(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Loaded graph snapshot"
        );
        Ok(graph)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(id, properties)| SnapshotNode {
                    id: id.clone(),
                    properties: properties.clone(),
                })
                .collect(),
            edges: self.edges().collect(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&snapshot)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
