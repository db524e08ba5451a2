//! Structural record schemas.
//!
//! Schemas are compared structurally (field names and types), never by name.
//! The same model drives build-time edge compatibility checks and runtime
//! validation of emitted records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{Record, Value};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Any,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Timestamp,
    List,
    Map,
}

impl FieldType {
    /// Whether a value produced as `self` can be consumed as `wanted`.
    #[must_use]
    pub fn feeds(self, wanted: FieldType) -> bool {
        wanted == FieldType::Any || self == wanted
    }

    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::Bool, Value::Bool(_))
                | (Self::Int, Value::Int(_))
                | (Self::Float, Value::Float(_))
                | (Self::String, Value::Str(_))
                | (Self::Bytes, Value::Bytes(_))
                | (Self::Timestamp, Value::Timestamp(_))
                | (Self::List, Value::List(_))
                | (Self::Map, Value::Map(_))
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
            Self::List => "list",
            Self::Map => "map",
        };
        f.write_str(s)
    }
}

/// A single field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub nullable: bool,
}

impl FieldSpec {
    #[must_use]
    pub fn required(ty: FieldType) -> Self {
        Self { ty, nullable: false }
    }

    #[must_use]
    pub fn nullable(ty: FieldType) -> Self {
        Self { ty, nullable: true }
    }
}

/// Field name → declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check that records shaped like `self` satisfy `downstream`.
    ///
    /// Every field the downstream schema declares must be present upstream
    /// with a type that feeds it; a nullable upstream field cannot feed a
    /// non-nullable downstream one. Extra upstream fields are allowed.
    ///
    /// # Errors
    ///
    /// Returns one message per incompatible field.
    pub fn check_feeds(&self, downstream: &Schema) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        for (name, wanted) in &downstream.fields {
            match self.fields.get(name) {
                None => problems.push(format!("field '{name}' is not produced upstream")),
                Some(have) => {
                    if !have.ty.feeds(wanted.ty) {
                        problems.push(format!(
                            "field '{name}' is {} upstream but {} is expected",
                            have.ty, wanted.ty
                        ));
                    }
                    if have.nullable && !wanted.nullable {
                        problems.push(format!(
                            "field '{name}' is nullable upstream but required downstream"
                        ));
                    }
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Validate a record's payload against this schema.
    ///
    /// # Errors
    ///
    /// Returns one message per missing or mistyped field.
    pub fn validate(&self, record: &Record) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        for (name, spec) in &self.fields {
            match record.get(name) {
                None | Some(Value::Null) if spec.nullable => {}
                None => problems.push(format!("missing field '{name}'")),
                Some(Value::Null) => problems.push(format!("field '{name}' must not be null")),
                Some(value) if !spec.ty.matches(value) => {
                    problems.push(format!("field '{name}' is not of type {}", spec.ty));
                }
                Some(_) => {}
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fields, RecordId};

    fn upstream() -> Schema {
        Schema::new()
            .field("id", FieldSpec::required(FieldType::Int))
            .field("name", FieldSpec::nullable(FieldType::String))
            .field("extra", FieldSpec::required(FieldType::Bool))
    }

    #[test]
    fn compatible_subset_passes() {
        let down = Schema::new()
            .field("id", FieldSpec::required(FieldType::Any))
            .field("name", FieldSpec::nullable(FieldType::String));
        assert!(upstream().check_feeds(&down).is_ok());
    }

    #[test]
    fn missing_and_mistyped_fields_are_reported() {
        let down = Schema::new()
            .field("id", FieldSpec::required(FieldType::String))
            .field("email", FieldSpec::required(FieldType::String));
        let problems = upstream().check_feeds(&down).unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("'email'")));
        assert!(problems.iter().any(|p| p.contains("int upstream")));
    }

    #[test]
    fn nullable_cannot_feed_required() {
        let down = Schema::new().field("name", FieldSpec::required(FieldType::String));
        let problems = upstream().check_feeds(&down).unwrap_err();
        assert!(problems[0].contains("nullable upstream"));
    }

    #[test]
    fn validate_record_payload() {
        let schema = upstream();
        let ok = Record::collected(
            RecordId::new("c", 1),
            fields([("id", Value::Int(1)), ("extra", Value::Bool(false))]),
        );
        assert!(schema.validate(&ok).is_ok());

        let bad = Record::collected(RecordId::new("c", 2), fields([("id", "one")]));
        let problems = schema.validate(&bad).unwrap_err();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn schema_yaml_shape() {
        let schema: Schema =
            serde_json::from_value(serde_json::json!({"id": {"type": "int"}})).unwrap();
        assert_eq!(schema.get("id"), Some(&FieldSpec::required(FieldType::Int)));
    }
}
