//! Pipeline error model and retry backoff policy helpers.

use std::fmt;
use std::time::Duration;

use lubrikit_types::{ErrorKind, RecordId, StageError};
use rand::Rng;

use crate::config::types::RetryConfig;

/// Largest fraction of a delay added as random jitter.
const MAX_JITTER_FRACTION: f64 = 0.1;

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Categorized pipeline error.
///
/// `Configuration` is raised before any worker starts. `Stage` carries the
/// terminal failure of a run that halted. `ExecutorFault` reports a broken
/// internal invariant. `Infrastructure` wraps opaque host-side errors (state
/// backend, task join failures).
#[derive(Debug)]
pub enum PipelineError {
    Configuration(ConfigurationError),
    Stage(Box<StageFailure>),
    ExecutorFault(String),
    Infrastructure(anyhow::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(e) => write!(f, "{e}"),
            Self::Stage(e) => write!(f, "{e}"),
            Self::ExecutorFault(msg) => write!(f, "executor fault: {msg}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<ConfigurationError> for PipelineError {
    fn from(e: ConfigurationError) -> Self {
        Self::Configuration(e)
    }
}

impl From<StageFailure> for PipelineError {
    fn from(e: StageFailure) -> Self {
        Self::Stage(Box::new(e))
    }
}

impl PipelineError {
    pub(crate) fn configuration(problem: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::new(vec![problem.into()]))
    }

    pub(crate) fn fault(msg: impl Into<String>) -> Self {
        Self::ExecutorFault(msg.into())
    }

    /// Returns the stage failure if this is a `Stage` variant.
    #[must_use]
    pub fn as_stage_failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Stage(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the configuration problems if this is a `Configuration` variant.
    #[must_use]
    pub fn as_configuration(&self) -> Option<&ConfigurationError> {
        match self {
            Self::Configuration(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// The pipeline cannot be built. Lists every problem found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    pub problems: Vec<String>,
}

impl ConfigurationError {
    #[must_use]
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }

    /// Whether any problem mentions `needle`.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        self.problems.iter().any(|p| p.contains(needle))
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline validation failed:\n  - {}",
            self.problems.join("\n  - ")
        )
    }
}

impl std::error::Error for ConfigurationError {}

/// One failed attempt that was followed by a retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    pub attempt: u32,
    pub delay: Duration,
    pub error: StageError,
}

/// Terminal failure of a stage call that halted the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    /// Taxonomy class of the terminal error. `Transient` means retries were
    /// exhausted or not allowed.
    pub classification: ErrorKind,
    pub stage: String,
    /// Identity of the first record involved, if the call had any input.
    pub record: Option<RecordId>,
    pub error: StageError,
    pub attempts: u32,
    pub retry_history: Vec<RetryRecord>,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure in stage '{}'",
            self.classification, self.stage
        )?;
        if let Some(record) = &self.record {
            write!(f, " on record {record}")?;
        }
        write!(f, " after {} attempt(s): {}", self.attempts, self.error)
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Compute the delay before retrying after the given (1-based) attempt.
///
/// An explicit `retry_after_ms` on the error wins, capped at `max_delay_ms`.
/// Otherwise the delay is `base_delay_ms * backoff_factor^(attempt-1)`
/// capped at `max_delay_ms`, plus up to 10% jitter when enabled.
pub(crate) fn compute_backoff(policy: &RetryConfig, err: &StageError, attempt: u32) -> Duration {
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms.min(policy.max_delay_ms));
    }

    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    #[allow(clippy::cast_precision_loss)]
    let raw = policy.base_delay_ms as f64 * policy.backoff_factor.powi(exponent);
    #[allow(clippy::cast_precision_loss)]
    let capped = raw.min(policy.max_delay_ms as f64);

    let with_jitter = if policy.jitter && capped > 0.0 {
        capped + capped * rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION)
    } else {
        capped
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let delay_ms = with_jitter.max(0.0).round() as u64;
    Duration::from_millis(delay_ms)
}
