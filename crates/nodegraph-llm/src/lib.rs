pub mod anthropic;
pub mod client;
pub mod embedding;
pub mod error_cache;

use std::sync::Arc;

use nodegraph_core::config::{LlmConfig, LlmProvider};
use nodegraph_core::llm::LlmBackend;

pub use anthropic::AnthropicBackend;
pub use client::{looks_like_failure, CallOutcome, OrchestrationClient};
pub use embedding::OpenAiEmbedder;
pub use error_cache::{ErrorCache, ErrorCacheEntry};

/// Resolve the configured provider to a backend.
pub fn build_backend(config: &LlmConfig) -> Arc<dyn LlmBackend> {
    match config.provider {
        LlmProvider::Anthropic => Arc::new(AnthropicBackend::new(config)),
    }
}
