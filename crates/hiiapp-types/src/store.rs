//! Document model shared by the embedded store, the HTTP surface and the
//! client adapters.
//!
//! Documents are JSON objects addressed by `collection/id`. Queries run over
//! a single collection with a conjunction of filters and at most one
//! ordering field, which is the whole query surface the chat client needs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

// -- Paths --

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath {
    collection: String,
    id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse `a/b/c/d` style paths. A document path always has an even
    /// number of non-empty segments.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidArgument(format!("not a document path: {}", path));
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if segments.len() % 2 != 0 || segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }
        let Some((id, collection)) = segments.split_last() else {
            return Err(invalid());
        };
        Ok(Self {
            collection: collection.join("/"),
            id: id.to_string(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

impl TryFrom<String> for DocPath {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.to_string()
    }
}

// -- Documents --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        lookup(&self.data, field)
    }

    /// Deserialize into a model type. The document id is injected as `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut data = self.data.clone();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(data))
            .map_err(|e| StoreError::Internal(format!("malformed document {}: {}", self.id, e)))
    }
}

/// Dotted field lookup (`a.b` reads `{"a": {"b": ..}}`).
fn lookup<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub documents: Vec<Document>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn decode_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        self.documents.iter().map(Document::decode).collect()
    }
}

// -- Writes --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the commit timestamp when the write is applied.
    ServerTimestamp,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), FieldValue::Value(value.into()));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldValue::ServerTimestamp);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Resolve server timestamps to `timestamp` (epoch microseconds).
    pub fn resolve(&self, timestamp: i64) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(field, value)| {
                let value = match value {
                    FieldValue::Value(v) => v.clone(),
                    FieldValue::ServerTimestamp => Value::from(timestamp),
                };
                (field.clone(), value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Write {
    /// Insert; fails with `AlreadyExists` if the document is present.
    Create { path: DocPath, fields: Fields },
    /// Upsert. With `merge` only the given top-level fields are replaced.
    Set { path: DocPath, fields: Fields, merge: bool },
    /// Partial update; fails with `NotFound` if the document is absent.
    Update { path: DocPath, fields: Fields },
}

impl Write {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Create { path, .. } | Self::Set { path, .. } | Self::Update { path, .. } => path,
        }
    }
}

// -- Queries --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => compare_same_type(actual, &self.value) == Some(Ordering::Equal),
            FilterOp::Lt => compare_same_type(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_same_type(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_same_type(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_same_type(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.iter().any(|item| compare_same_type(item, &self.value) == Some(Ordering::Equal))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(order) = &self.order_by {
            if doc.get(&order.field).is_none() {
                return false;
            }
        }
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, order and truncate a collection's documents.
    pub fn apply(&self, documents: Vec<Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = documents.into_iter().filter(|d| self.matches(d)).collect();

        match &self.order_by {
            Some(order) => matched.sort_by(|a, b| {
                let ord = match (a.get(&order.field), b.get(&order.field)) {
                    (Some(x), Some(y)) => total_order(x, y),
                    _ => Ordering::Equal,
                }
                .then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            }),
            None => matched.sort_by(|a, b| a.id.cmp(&b.id)),
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two values of the same JSON type. Values of different types are
/// incomparable, so range filters never match across types.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            (a == b).then_some(Ordering::Equal)
        }
        _ => None,
    }
}

/// Ordering used for sorting: by type rank first, then by value.
fn total_order(a: &Value, b: &Value) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_same_type(a, b).unwrap_or(Ordering::Equal))
}
