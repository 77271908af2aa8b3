pub mod builder;
pub mod graph;
pub mod memory;
pub mod persist;
pub mod store;

pub use builder::{BuildOutcome, BuildReport, GraphBuilder};
pub use graph::KnowledgeGraph;
pub use memory::MemoryGraphStore;
pub use persist::JsonlRecordStore;
pub use store::Neo4jGraphStore;
