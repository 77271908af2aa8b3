use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::graph::NodeKind;
use crate::hashing::{content_hash, pair_hash, IdAllocator};
use crate::records::NodeRecord;

/// Coerce one extracted field to a string. Nulls and containers become "".
pub fn sanitize_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Sanitize a relationship tuple to exactly `[source, relation, target]`,
/// truncating extra fields and padding missing ones with "".
pub fn sanitize_triple(values: &[serde_json::Value]) -> [String; 3] {
    let mut fields: [String; 3] = Default::default();
    for (slot, value) in fields.iter_mut().zip(values.iter()) {
        *slot = sanitize_field(value);
    }
    fields
}

/// Same as [`sanitize_triple`] for fields that are already strings.
pub fn fit_triple(fields: &[String]) -> [String; 3] {
    let mut triple: [String; 3] = Default::default();
    for (slot, field) in triple.iter_mut().zip(fields.iter()) {
        slot.clone_from(field);
    }
    triple
}

/// A chunk of source text fed to decomposition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextUnit {
    pub hash_id: String,
    pub text_id: String,
    pub raw_text: String,
}

impl TextUnit {
    pub fn new(text_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        let text_id = text_id.into();
        let raw_text = raw_text.into();
        Self {
            hash_id: content_hash(&[raw_text.as_str(), text_id.as_str()]),
            text_id,
            raw_text,
        }
    }
}

/// One paraphrased idea extracted from a text unit.
#[derive(Debug, Clone)]
pub struct SemanticUnit {
    pub hash_id: String,
    pub raw_context: String,
    pub text_hash_id: String,
    human_readable_id: OnceLock<u64>,
}

impl SemanticUnit {
    pub fn new(raw_context: impl Into<String>, text_hash_id: impl Into<String>) -> Self {
        let raw_context = raw_context.into();
        let text_hash_id = text_hash_id.into();
        Self {
            hash_id: content_hash(&[
                NodeKind::SemanticUnit.as_str(),
                raw_context.as_str(),
                text_hash_id.as_str(),
            ]),
            raw_context,
            text_hash_id,
            human_readable_id: OnceLock::new(),
        }
    }

    pub fn human_readable_id(&self, ids: &IdAllocator) -> u64 {
        *self
            .human_readable_id
            .get_or_init(|| ids.next(NodeKind::SemanticUnit))
    }

    pub fn to_record(&self, ids: &IdAllocator, weight: u64) -> NodeRecord {
        NodeRecord {
            hash_id: self.hash_id.clone(),
            human_readable_id: self.human_readable_id(ids),
            kind: NodeKind::SemanticUnit,
            context: self.raw_context.clone(),
            text_hash_id: self.text_hash_id.clone(),
            weight,
            endpoints: None,
        }
    }
}

impl PartialEq for SemanticUnit {
    fn eq(&self, other: &Self) -> bool {
        self.hash_id == other.hash_id
    }
}

impl Eq for SemanticUnit {}

/// A named thing. The name is trimmed and uppercased before hashing.
#[derive(Debug, Clone)]
pub struct Entity {
    pub hash_id: String,
    pub raw_context: String,
    pub text_hash_id: String,
    human_readable_id: OnceLock<u64>,
}

impl Entity {
    pub fn new(name: &str, text_hash_id: impl Into<String>) -> Self {
        let raw_context = normalize_name(name);
        let text_hash_id = text_hash_id.into();
        Self {
            hash_id: content_hash(&[
                NodeKind::Entity.as_str(),
                raw_context.as_str(),
                text_hash_id.as_str(),
            ]),
            raw_context,
            text_hash_id,
            human_readable_id: OnceLock::new(),
        }
    }

    pub fn human_readable_id(&self, ids: &IdAllocator) -> u64 {
        *self
            .human_readable_id
            .get_or_init(|| ids.next(NodeKind::Entity))
    }

    pub fn to_record(&self, ids: &IdAllocator, weight: u64) -> NodeRecord {
        NodeRecord {
            hash_id: self.hash_id.clone(),
            human_readable_id: self.human_readable_id(ids),
            kind: NodeKind::Entity,
            context: self.raw_context.clone(),
            text_hash_id: self.text_hash_id.clone(),
            weight,
            endpoints: None,
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.hash_id == other.hash_id
    }
}

impl Eq for Entity {}

pub fn normalize_name(name: &str) -> String {
    name.trim().to_uppercase()
}

/// `[source, relation, target]` with its endpoint entities resolved.
#[derive(Debug, Clone)]
pub struct RelationshipTriple {
    pub fields: [String; 3],
    pub source: Entity,
    pub target: Entity,
}

impl RelationshipTriple {
    pub fn new(fields: [String; 3], text_hash_id: &str) -> Self {
        let source = Entity::new(&fields[0], text_hash_id);
        let target = Entity::new(&fields[2], text_hash_id);
        Self {
            fields,
            source,
            target,
        }
    }

    pub fn raw_context(&self) -> String {
        self.fields.join(" ")
    }

    pub fn endpoints(&self) -> EndpointPair {
        EndpointPair::new(&self.source.hash_id, &self.target.hash_id)
    }
}

/// Unordered pair of endpoint hash ids, stored sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair([String; 2]);

impl EndpointPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self([a.to_string(), b.to_string()])
        } else {
            Self([b.to_string(), a.to_string()])
        }
    }

    pub fn hash_id(&self) -> String {
        pair_hash(&self.0[0], &self.0[1])
    }

    pub fn first(&self) -> &str {
        &self.0[0]
    }

    pub fn second(&self) -> &str {
        &self.0[1]
    }

    pub fn contains(&self, hash_id: &str) -> bool {
        self.0.iter().any(|h| h == hash_id)
    }

    pub fn as_array(&self) -> &[String; 2] {
        &self.0
    }
}

/// An undirected link between two entities. Identity is the endpoint pair;
/// every raw extraction that maps onto it is kept in `raw_context`.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub hash_id: String,
    pub endpoints: EndpointPair,
    pub raw_context: String,
    pub text_hash_id: String,
    human_readable_id: OnceLock<u64>,
}

impl Relationship {
    pub fn from_triple(triple: &RelationshipTriple, text_hash_id: impl Into<String>) -> Self {
        let endpoints = triple.endpoints();
        Self {
            hash_id: endpoints.hash_id(),
            endpoints,
            raw_context: triple.raw_context(),
            text_hash_id: text_hash_id.into(),
            human_readable_id: OnceLock::new(),
        }
    }

    /// Rebuild a relationship from its persisted record. Returns `None` for
    /// records without endpoints.
    pub fn from_record(record: &NodeRecord) -> Option<Self> {
        let [a, b] = record.endpoints.as_ref()?;
        let endpoints = EndpointPair::new(a, b);
        Some(Self {
            hash_id: endpoints.hash_id(),
            endpoints,
            raw_context: record.context.clone(),
            text_hash_id: record.text_hash_id.clone(),
            human_readable_id: OnceLock::from(record.human_readable_id),
        })
    }

    /// Append another raw extraction of the same relationship.
    pub fn add(&mut self, triple: &RelationshipTriple) {
        self.raw_context.push('\t');
        self.raw_context.push_str(&triple.raw_context());
    }

    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.raw_context.split('\t')
    }

    pub fn human_readable_id(&self, ids: &IdAllocator) -> u64 {
        *self
            .human_readable_id
            .get_or_init(|| ids.next(NodeKind::Relationship))
    }

    pub fn to_record(&self, ids: &IdAllocator, weight: u64) -> NodeRecord {
        NodeRecord {
            hash_id: self.hash_id.clone(),
            human_readable_id: self.human_readable_id(ids),
            kind: NodeKind::Relationship,
            context: self.raw_context.clone(),
            text_hash_id: self.text_hash_id.clone(),
            weight,
            endpoints: Some(self.endpoints.as_array().clone()),
        }
    }
}

impl PartialEq for Relationship {
    fn eq(&self, other: &Self) -> bool {
        self.endpoints == other.endpoints
    }
}

impl Eq for Relationship {}

impl Hash for Relationship {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoints.hash(state);
    }
}
