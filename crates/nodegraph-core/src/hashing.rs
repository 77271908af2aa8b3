use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::graph::NodeKind;

/// SHA-256 over the UTF-8 concatenation of `parts`, hex encoded.
pub fn content_hash<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hash of an unordered endpoint pair. `pair_hash(a, b) == pair_hash(b, a)`.
pub fn pair_hash(a: &str, b: &str) -> String {
    if a <= b {
        content_hash(&[a, b])
    } else {
        content_hash(&[b, a])
    }
}

/// Per-class counters for human-readable ids.
///
/// Counters start at 1 and never go backwards. One allocator is shared by a
/// whole build and handed to every component that needs ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    semantic_units: AtomicU64,
    entities: AtomicU64,
    relationships: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: NodeKind) -> Option<&AtomicU64> {
        match kind {
            NodeKind::SemanticUnit => Some(&self.semantic_units),
            NodeKind::Entity => Some(&self.entities),
            NodeKind::Relationship => Some(&self.relationships),
            _ => None,
        }
    }

    /// Next id for `kind`. Kinds that are not built by this crate share the
    /// entity counter.
    pub fn next(&self, kind: NodeKind) -> u64 {
        let counter = self.counter(kind).unwrap_or(&self.entities);
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make sure future ids for `kind` are strictly greater than `max_issued`.
    pub fn resume_after(&self, kind: NodeKind, max_issued: u64) {
        if let Some(counter) = self.counter(kind) {
            counter.fetch_max(max_issued, Ordering::SeqCst);
        }
    }

    pub fn issued(&self, kind: NodeKind) -> u64 {
        self.counter(kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or_default()
    }
}
