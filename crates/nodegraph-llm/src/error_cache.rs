use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use nodegraph_core::error::Result;
use nodegraph_core::llm::LlmRequest;
use nodegraph_core::records::{append_jsonl, read_jsonl};

/// One failed call kept for replay. The response schema is stripped from
/// `input` and restored by whoever replays it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorCacheEntry {
    pub input: LlmRequest,
    #[serde(alias = "meta_data")]
    pub metadata: serde_json::Value,
}

impl ErrorCacheEntry {
    pub fn new(request: &LlmRequest, metadata: serde_json::Value) -> Self {
        let mut input = request.clone();
        input.response_format = None;
        Self { input, metadata }
    }
}

/// Append-only JSON-lines file of failed calls.
pub struct ErrorCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ErrorCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &ErrorCacheEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        append_jsonl(&self.path, std::slice::from_ref(entry)).await
    }

    pub async fn entries(&self) -> Result<Vec<ErrorCacheEntry>> {
        read_jsonl(&self.path).await
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    /// Empty the file without deleting it.
    pub async fn truncate(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, b"").await?;
        Ok(())
    }
}
