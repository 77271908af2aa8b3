pub mod config;
pub mod entity;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod llm;
pub mod records;

pub use config::{AppConfig, DispatchPolicy, OrchestrationConfig, RankingMode, RetrievalConfig};
pub use entity::{Entity, EndpointPair, Relationship, RelationshipTriple, SemanticUnit, TextUnit};
pub use error::{NodeGraphError, Result};
pub use graph::{GraphStats, GraphStore, NodeKind, NodeProperties, WeightedEdge};
pub use hashing::{content_hash, pair_hash, IdAllocator};
pub use llm::{
    parse_json_reply, Embedder, LlmBackend, LlmRequest, LlmResponse, ResponseSchema, VectorIndex,
};
pub use records::{NodeRecord, RecordStore, TextUnitRecord};
