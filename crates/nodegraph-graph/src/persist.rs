use std::path::{Path, PathBuf};

use async_trait::async_trait;

use nodegraph_core::error::Result;
use nodegraph_core::graph::NodeKind;
use nodegraph_core::records::{append_jsonl, read_jsonl, write_jsonl, NodeRecord, RecordStore};

/// One JSON-lines file per node kind under a directory.
pub struct JsonlRecordStore {
    dir: PathBuf,
}

impl JsonlRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: NodeKind) -> PathBuf {
        self.dir.join(format!("{}.jsonl", kind.as_str()))
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn load(&self, kind: NodeKind) -> Result<Vec<NodeRecord>> {
        read_jsonl(&self.path_for(kind)).await
    }

    async fn append(&self, kind: NodeKind, records: &[NodeRecord]) -> Result<()> {
        append_jsonl(&self.path_for(kind), records).await
    }

    async fn overwrite(&self, kind: NodeKind, records: &[NodeRecord]) -> Result<()> {
        write_jsonl(&self.path_for(kind), records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, kind: NodeKind) -> NodeRecord {
        NodeRecord {
            hash_id: hash.to_string(),
            human_readable_id: 1,
            kind,
            context: "ALICE".to_string(),
            text_hash_id: "t".to_string(),
            weight: 1,
            endpoints: None,
        }
    }

    #[tokio::test]
    async fn test_kinds_are_stored_separately() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRecordStore::new(dir.path());
        store
            .append(NodeKind::Entity, &[record("e1", NodeKind::Entity)])
            .await
            .unwrap();
        store
            .append(NodeKind::SemanticUnit, &[record("s1", NodeKind::SemanticUnit)])
            .await
            .unwrap();

        assert_eq!(store.load(NodeKind::Entity).await.unwrap().len(), 1);
        assert_eq!(store.load(NodeKind::Relationship).await.unwrap().len(), 0);
        assert!(store.path_for(NodeKind::Entity).ends_with("entity.jsonl"));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRecordStore::new(dir.path());
        let first = [record("e1", NodeKind::Entity), record("e2", NodeKind::Entity)];
        store.append(NodeKind::Entity, &first).await.unwrap();
        store
            .overwrite(NodeKind::Entity, &first[..1])
            .await
            .unwrap();
        let loaded = store.load(NodeKind::Entity).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash_id, "e1");
    }
}
