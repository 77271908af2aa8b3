use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    SemanticUnit,
    Entity,
    Relationship,
    Attribute,
    HighLevelElement,
    HighLevelElementTitle,
    Text,
    #[serde(other)]
    Unknown,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::SemanticUnit => "semantic_unit",
            NodeKind::Entity => "entity",
            NodeKind::Relationship => "relationship",
            NodeKind::Attribute => "attribute",
            NodeKind::HighLevelElement => "high_level_element",
            NodeKind::HighLevelElementTitle => "high_level_element_title",
            NodeKind::Text => "text",
            NodeKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> NodeKind {
        match s {
            "semantic_unit" => NodeKind::SemanticUnit,
            "entity" => NodeKind::Entity,
            "relationship" => NodeKind::Relationship,
            "attribute" => NodeKind::Attribute,
            "high_level_element" => NodeKind::HighLevelElement,
            "high_level_element_title" => NodeKind::HighLevelElementTitle,
            "text" => NodeKind::Text,
            _ => NodeKind::Unknown,
        }
    }

    /// The kinds produced by the construction stage, in persistence order.
    pub const BUILT: [NodeKind; 3] = [
        NodeKind::SemanticUnit,
        NodeKind::Entity,
        NodeKind::Relationship,
    ];
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Properties of one node as seen through a [`GraphStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeProperties {
    pub kind: NodeKind,
    pub weight: u64,
    /// Attribute nodes linked to an entity.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// The element a high-level-element title points at.
    #[serde(default)]
    pub related_node: Option<String>,
}

impl NodeProperties {
    pub fn new(kind: NodeKind, weight: u64) -> Self {
        Self {
            kind,
            weight,
            attributes: Vec::new(),
            related_node: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedEdge {
    pub source: String,
    pub target: String,
    pub weight: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphStats {
    pub nodes: u64,
    pub edges: u64,
    pub by_kind: BTreeMap<NodeKind, u64>,
}

/// The narrow graph surface the retrieval engine works against. Implemented
/// by the in-memory graph and by the external graph database.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Distinct ids reachable from any seed within `max_hops`, seeds included.
    async fn neighborhood(&self, seeds: &[String], max_hops: u32) -> Result<Vec<String>>;

    /// Every edge whose endpoints are both in `ids`.
    async fn edges_among(&self, ids: &[String]) -> Result<Vec<WeightedEdge>>;

    /// Properties for each id that exists in the store. Missing ids are absent.
    async fn node_properties(&self, ids: &[String]) -> Result<HashMap<String, NodeProperties>>;

    /// Store-side neighbor scoring. `None` means the store has no native
    /// scoring and the caller ranks locally.
    async fn native_scores(
        &self,
        _personalization: &HashMap<String, f64>,
    ) -> Result<Option<Vec<(String, f64)>>> {
        Ok(None)
    }

    async fn stats(&self) -> Result<GraphStats>;
}
