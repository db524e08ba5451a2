//! Records, values, and batches.
//!
//! A [`Record`] is an immutable, copy-on-write mapping from field name to
//! [`Value`] plus an identity ([`RecordId`]) assigned once by the collector
//! worker that emitted it. Payload edits always produce a new record that
//! keeps the original identity.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field name → value mapping carried by a record.
pub type Fields = BTreeMap<String, Value>;

/// Ordered group of records handed to a stage in one call.
pub type Batch = Vec<Record>;

/// Typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Convert into a plain JSON value (used for dead-letter payloads).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Str(v) => serde_json::Value::String(v.clone()),
            Self::Bytes(v) => serde_json::Value::Array(
                v.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Self::Timestamp(v) => serde_json::Value::String(v.to_rfc3339()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// Identity of a record: the collector stage that emitted it and its
/// position in that collector's emission sequence (starting at 1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub origin: String,
    pub sequence: u64,
}

impl RecordId {
    #[must_use]
    pub fn new(origin: impl Into<String>, sequence: u64) -> Self {
        Self {
            origin: origin.into(),
            sequence,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

/// Immutable record flowing through a pipeline.
///
/// Cloning is cheap: the payload is shared until one side edits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: Arc<RecordId>,
    ingested_at: DateTime<Utc>,
    fields: Arc<Fields>,
}

impl Record {
    /// Stamp a freshly collected payload with its identity.
    ///
    /// Identities are assigned by the executor when a collector emits a
    /// payload. Stages derive records from the ones they receive
    /// ([`with_field`](Self::with_field), [`with_fields`](Self::with_fields),
    /// [`map_fields`](Self::map_fields)); a processor output carrying an
    /// identity it never received fails the stage with `UNKNOWN_IDENTITY`.
    #[doc(hidden)]
    #[must_use]
    pub fn collected(id: RecordId, fields: Fields) -> Self {
        Self {
            id: Arc::new(id),
            ingested_at: Utc::now(),
            fields: Arc::new(fields),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.id.origin
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.id.sequence
    }

    #[must_use]
    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// New record with `name` set to `value`; identity is preserved.
    #[must_use]
    pub fn with_field(&self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.fields).insert(name.into(), value.into());
        next
    }

    /// New record without `name`; identity is preserved.
    #[must_use]
    pub fn without_field(&self, name: &str) -> Self {
        let mut next = self.clone();
        if next.fields.contains_key(name) {
            Arc::make_mut(&mut next.fields).remove(name);
        }
        next
    }

    /// New record with the payload replaced wholesale; identity is preserved.
    #[must_use]
    pub fn with_fields(&self, fields: Fields) -> Self {
        Self {
            id: Arc::clone(&self.id),
            ingested_at: self.ingested_at,
            fields: Arc::new(fields),
        }
    }

    /// New record whose payload is `f` applied to a copy of this one.
    #[must_use]
    pub fn map_fields(&self, f: impl FnOnce(&mut Fields)) -> Self {
        let mut next = self.clone();
        f(Arc::make_mut(&mut next.fields));
        next
    }

    /// Whether two records share identity and payload, ignoring timestamps.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id && self.fields == other.fields
    }

    /// JSON rendering of identity and payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "origin": self.id.origin,
            "sequence": self.id.sequence,
            "ingested_at": self.ingested_at.to_rfc3339(),
            "fields": Value::Map(self.fields.as_ref().clone()).to_json(),
        })
    }
}

/// Build a [`Fields`] map from `(name, value)` pairs.
#[must_use]
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
