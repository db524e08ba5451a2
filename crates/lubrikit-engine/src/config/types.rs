//! Declarative pipeline configuration model.
//!
//! Deserialized from YAML by [`parser`](crate::config::parser) and also used
//! directly by [`PipelineBuilder`](crate::builder::PipelineBuilder) for
//! programmatic construction.

use lubrikit_types::{OverflowPolicy, Schema, StageRole};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUFFER_SIZE: usize = 64;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 100;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Top-level pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    /// Preserve each collector's emission order end-to-end.
    #[serde(default)]
    pub ordered: bool,
    /// Number of watermark advances between checkpoint writes.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_string(),
            pipeline: name.into(),
            ordered: false,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            state: StateConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            stages: Vec::new(),
            edges: Vec::new(),
        }
    }
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// In-memory `SQLite`; checkpoints do not outlive the process.
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path for the `sqlite` backend.
    #[serde(default)]
    pub connection: Option<String>,
}

/// Failure handler policy for records that cannot be processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetterConfig {
    /// Route failed records to the dead-letter store and keep running.
    /// When disabled, permanent failures halt the pipeline.
    #[serde(default)]
    pub enabled: bool,
}

/// One stage in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    /// Registered stage type to instantiate.
    #[serde(rename = "type")]
    pub stage_type: String,
    /// Expected role; must agree with the registration when set.
    #[serde(default)]
    pub role: Option<StageRole>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Capacity of inbound edges that do not set their own.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Overflow policy of inbound edges that do not set their own.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_linger_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides the registration's idempotency flag.
    #[serde(default)]
    pub idempotent: Option<bool>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Overrides the registration's input schema.
    #[serde(default)]
    pub input_schema: Option<Schema>,
    /// Overrides the registration's output schema.
    #[serde(default)]
    pub output_schema: Option<Schema>,
    /// Free-form configuration handed to the stage constructor.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_concurrency() -> usize {
    1
}

impl StageConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, stage_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage_type: stage_type.into(),
            role: None,
            concurrency: 1,
            buffer_size: None,
            overflow: OverflowPolicy::Block,
            batch_size: None,
            batch_linger_ms: None,
            timeout_ms: None,
            idempotent: None,
            retry: RetryConfig::default(),
            input_schema: None,
            output_schema: None,
            config: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: StageRole) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    #[must_use]
    pub fn with_buffer(mut self, size: usize, overflow: OverflowPolicy) -> Self {
        self.buffer_size = Some(size);
        self.overflow = overflow;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, size: usize, linger_ms: Option<u64>) -> Self {
        self.batch_size = Some(size);
        self.batch_linger_ms = linger_ms;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Retry policy for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Add up to 10% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Disable retries: a single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attempts(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

/// Directed connection between two stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    pub from: String,
    pub to: String,
    /// Queue capacity; defaults to the consumer's `buffer_size`.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Overflow policy; defaults to the consumer's `overflow`.
    #[serde(default)]
    pub overflow: Option<OverflowPolicy>,
}

impl EdgeConfig {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            capacity: None,
            overflow: None,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = Some(overflow);
        self
    }
}
