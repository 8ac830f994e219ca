//! Documents, projections and filters.
//!
//! Documents are JSON objects identified by their `_id` field. On the wire
//! (in [`RawEvent`](crate::RawEvent)) they travel CBOR-encoded.

use crate::error::{ProtocolError, ProtocolResult};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Name of the identity field.
pub const ID_FIELD: &str = "_id";

/// Looks up a dotted field path (`a.b.c`) in a document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

/// Returns the document identity as a string.
///
/// String ids are returned as-is; any other JSON value is rendered.
pub fn document_id(doc: &Value) -> Option<String> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Encodes a value as CBOR.
pub fn encode_document<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(ProtocolError::codec)?;
    Ok(buf)
}

/// Decodes a CBOR document into `T`.
pub fn decode_document<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(ProtocolError::codec)
}

/// Field projection applied to listed and tailed documents.
///
/// An empty projection keeps the whole document. `_id` is always kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    /// Projection keeping every field.
    pub fn all() -> Self {
        Self::default()
    }

    /// Projection keeping the given (possibly dotted) paths.
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the projection keeps everything.
    pub fn is_all(&self) -> bool {
        self.fields.is_empty()
    }

    /// The projected paths.
    pub fn paths(&self) -> &[String] {
        &self.fields
    }

    /// Applies the projection to a document.
    pub fn apply(&self, doc: &Value) -> Value {
        if self.is_all() {
            return doc.clone();
        }
        let mut out = Map::new();
        if let Some(id) = doc.get(ID_FIELD) {
            out.insert(ID_FIELD.to_string(), id.clone());
        }
        for path in &self.fields {
            if let Some(value) = lookup_path(doc, path) {
                insert_path(&mut out, path, value.clone());
            }
        }
        Value::Object(out)
    }
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

/// Conjunction of equality predicates on document fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldFilter {
    predicates: Vec<(String, Value)>,
}

impl FieldFilter {
    /// Filter matching every document.
    pub fn any() -> Self {
        Self::default()
    }

    /// Adds an equality predicate on a (possibly dotted) path.
    #[must_use]
    pub fn equals(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push((path.into(), value.into()));
        self
    }

    /// Returns true if the filter has no predicates.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Returns true if the document satisfies every predicate.
    pub fn matches(&self, doc: &Value) -> bool {
        self.predicates
            .iter()
            .all(|(path, expected)| lookup_path(doc, path) == Some(expected))
    }
}

/// Collection-name-level filter.
#[derive(Debug, Clone)]
pub enum CollectionFilter {
    /// Any of the listed collection names.
    Names(Vec<String>),
    /// Collection names matching a regular expression.
    Pattern(Regex),
}

impl CollectionFilter {
    /// Builds a pattern filter.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Pattern)
    }

    /// Returns true if the collection name passes the filter.
    pub fn matches(&self, collection: &str) -> bool {
        match self {
            CollectionFilter::Names(names) => names.iter().any(|n| n == collection),
            CollectionFilter::Pattern(re) => re.is_match(collection),
        }
    }

    /// Returns true if the filter can never match.
    pub fn is_empty(&self) -> bool {
        match self {
            CollectionFilter::Names(names) => names.is_empty(),
            CollectionFilter::Pattern(_) => false,
        }
    }
}
