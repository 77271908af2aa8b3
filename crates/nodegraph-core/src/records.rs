use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::entity::TextUnit;
use crate::error::Result;
use crate::graph::NodeKind;

/// Persisted row for one graph node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub hash_id: String,
    pub human_readable_id: u64,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub context: String,
    pub text_hash_id: String,
    pub weight: u64,
    #[serde(
        rename = "unique_relationship",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub endpoints: Option<[String; 2]>,
}

/// One line of the decomposition log. Lines with `processed == false` are
/// the construction stage's work queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextUnitRecord {
    pub text_hash_id: String,
    #[serde(default)]
    pub text_id: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposed_at: Option<DateTime<Utc>>,
}

impl TextUnitRecord {
    pub fn decomposed(unit: &TextUnit, response: serde_json::Value) -> Self {
        Self {
            text_hash_id: unit.hash_id.clone(),
            text_id: unit.text_id.clone(),
            raw_text: unit.raw_text.clone(),
            processed: false,
            response: Some(response),
            decomposed_at: Some(Utc::now()),
        }
    }
}

/// Tabular node storage, one table per node kind.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self, kind: NodeKind) -> Result<Vec<NodeRecord>>;
    async fn append(&self, kind: NodeKind, records: &[NodeRecord]) -> Result<()>;
    async fn overwrite(&self, kind: NodeKind, records: &[NodeRecord]) -> Result<()>;
}

/// Read a JSON-lines file, skipping blank and malformed lines. A missing
/// file reads as empty.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut items = Vec::new();
    for (line_no, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed JSON line"
                );
            }
        }
    }
    Ok(items)
}

pub async fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item)?);
        buf.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Replace the file contents via a sibling temp file and rename.
pub async fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item)?);
        buf.push('\n');
    }
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, buf.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_jsonl_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        tokio::fs::write(
            &path,
            "{\"text_hash_id\":\"a\",\"processed\":true}\nnot json\n\n{\"text_hash_id\":\"b\"}\n",
        )
        .await
        .unwrap();

        let records: Vec<TextUnitRecord> = read_jsonl(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].processed);
        assert!(!records[1].processed);
        assert!(records[1].response.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<NodeRecord> = read_jsonl(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_append_then_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rows.jsonl");
        let row = NodeRecord {
            hash_id: "h".into(),
            human_readable_id: 1,
            kind: NodeKind::Relationship,
            context: "A r B".into(),
            text_hash_id: "t".into(),
            weight: 1,
            endpoints: Some(["a".into(), "b".into()]),
        };

        append_jsonl(&path, &[row.clone()]).await.unwrap();
        append_jsonl(&path, &[row.clone()]).await.unwrap();
        let rows: Vec<NodeRecord> = read_jsonl(&path).await.unwrap();
        assert_eq!(rows.len(), 2);

        write_jsonl(&path, &[row.clone()]).await.unwrap();
        let rows: Vec<NodeRecord> = read_jsonl(&path).await.unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[test]
    fn test_node_record_field_names() {
        let row = NodeRecord {
            hash_id: "h".into(),
            human_readable_id: 2,
            kind: NodeKind::Entity,
            context: "ALICE".into(),
            text_hash_id: "t".into(),
            weight: 4,
            endpoints: None,
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["type"], "entity");
        assert!(value.get("unique_relationship").is_none());
    }
}
