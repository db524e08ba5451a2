//! Structured error model for stage operations.
//!
//! [`StageError`] carries a [`ErrorKind`] classification, an operator-facing
//! code, and optional retry hints. Construct via the kind-specific factory
//! methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a stage failure.
///
/// Determines whether the executor retries the call and how the failure is
/// routed once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable (network blip, throttling, timeout of an idempotent call).
    Transient,
    /// Not retryable; escalated to the failure handler.
    Permanent,
    /// A record failed schema or business validation; never retried.
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "validation" => Ok(Self::Validation),
            other => Err(format!("unknown error kind '{other}'")),
        }
    }
}

/// Structured error returned by stage `open`/`collect`/`process`/`write`/`close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    /// Explicit delay requested before the next attempt (e.g. `Retry-After`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
            details: None,
        }
    }

    /// Retryable error.
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    /// Retryable error with an explicit delay hint.
    #[must_use]
    pub fn throttled(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorKind::Transient, code, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Non-retryable error.
    #[must_use]
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, code, message)
    }

    /// Record-level validation failure.
    #[must_use]
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Reclassify, keeping code and message.
    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}
