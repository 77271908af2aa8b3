pub mod engine;
pub mod index;
pub mod ppr;

pub use engine::{RankedResult, RetrievalEngine};
pub use index::{cosine_similarity, EmbeddingIndexer, EntityNameIndex, FlatVectorIndex, QaIndex, QaMatch};
pub use ppr::{personalized_pagerank, PprParams};
