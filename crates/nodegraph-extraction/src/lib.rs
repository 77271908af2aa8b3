pub mod decomposition;
pub mod pipeline;
pub mod prompts;

pub use decomposition::{DecomposedUnit, Decomposition, RawRelationship};
pub use pipeline::{DecompositionReport, SourceText, TextDecomposer};
