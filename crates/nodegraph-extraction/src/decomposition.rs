use serde_json::Value;

use nodegraph_core::entity::sanitize_field;
use nodegraph_core::llm::parse_json_reply;

/// A relationship as the model emitted it, before arity repair.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRelationship {
    /// `"SOURCE, relation, TARGET"`
    Text(String),
    /// Already split into fields, each coerced to a string.
    Fields(Vec<String>),
}

impl RawRelationship {
    /// Comma-split and whitespace-trimmed fields. Arity is not checked.
    pub fn fields(&self) -> Vec<String> {
        match self {
            RawRelationship::Text(text) => text.split(',').map(|f| f.trim().to_string()).collect(),
            RawRelationship::Fields(fields) => fields.clone(),
        }
    }

    /// The fragment as shown to the model when asking for reconstruction.
    pub fn fragment(&self) -> String {
        match self {
            RawRelationship::Text(text) => text.clone(),
            RawRelationship::Fields(fields) => fields.join(", "),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecomposedUnit {
    pub semantic_unit: String,
    pub entities: Vec<String>,
    pub relationships: Vec<RawRelationship>,
}

/// Parsed `{"Output": [...]}` decomposition reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    pub units: Vec<DecomposedUnit>,
}

impl Decomposition {
    /// Lenient structural parse. Returns `None` only when `value` is not an
    /// object or `Output` has an unusable shape; a missing `Output` is an
    /// empty decomposition.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let units = match object.get("Output").or_else(|| object.get("output")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().filter_map(parse_unit).collect(),
            Some(item @ Value::Object(_)) => parse_unit(item).into_iter().collect(),
            Some(_) => return None,
        };
        Some(Self { units })
    }

    /// Parse a text reply, tolerating fences and surrounding prose.
    pub fn from_reply(text: &str) -> Option<Self> {
        parse_json_reply(text).and_then(|value| Self::from_value(&value))
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn parse_unit(item: &Value) -> Option<DecomposedUnit> {
    let Some(object) = item.as_object() else {
        tracing::warn!(item = %item, "Skipping non-object decomposition item");
        return None;
    };

    let semantic_unit = object.get("semantic_unit").map(sanitize_field).unwrap_or_default();
    let entities = list_of(object.get("entities"))
        .iter()
        .map(sanitize_field)
        .collect();
    let relationships = list_of(object.get("relationships"))
        .iter()
        .map(|rel| match rel {
            Value::Array(fields) => RawRelationship::Fields(fields.iter().map(sanitize_field).collect()),
            other => RawRelationship::Text(sanitize_field(other)),
        })
        .collect();

    Some(DecomposedUnit {
        semantic_unit,
        entities,
        relationships,
    })
}

/// A list field that may arrive as a single scalar.
fn list_of(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}
