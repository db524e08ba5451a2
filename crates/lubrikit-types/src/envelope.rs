//! Dead-letter queue types.
//!
//! [`DlqRecord`] captures a record that could not be delivered, together
//! with the failure classification and the attempts made.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO-8601 formatted timestamp string.
///
/// No format validation; callers are trusted to provide valid ISO-8601.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().to_rfc3339())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record routed to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRecord {
    /// Stage at which the record failed.
    pub stage: String,
    /// Collector that emitted the record.
    pub origin: String,
    /// Sequence number within the collector's emission stream.
    pub sequence: u64,
    /// JSON-serialized record content.
    pub record_json: String,
    /// Human-readable error description.
    pub error_message: String,
    /// Error classification.
    pub error_kind: ErrorKind,
    /// Number of attempts made before giving up.
    pub attempts: u32,
    /// When the failure occurred.
    pub failed_at: Timestamp,
}
