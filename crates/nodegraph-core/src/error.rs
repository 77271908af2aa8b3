use thiserror::Error;

use crate::graph::NodeKind;

#[derive(Error, Debug)]
pub enum NodeGraphError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Consistency violation for {kind}: {graph_nodes} graph nodes but {records} records")]
    Consistency {
        kind: NodeKind,
        graph_nodes: usize,
        records: usize,
    },

    #[error("{count} LLM call(s) remain in the failure cache; rerun after fixing the cause")]
    UnresolvedFailures { count: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, NodeGraphError>;
