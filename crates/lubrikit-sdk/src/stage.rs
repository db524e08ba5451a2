//! Async stage traits and the descriptor each stage type registers with.
//!
//! Every stage follows the same lifecycle: `open` acquires external
//! resources, the role-specific call runs any number of times, and `close`
//! releases resources. The executor calls `close` exactly once per instance,
//! including when `open` or a later call failed.

use std::sync::Arc;

use async_trait::async_trait;
use lubrikit_types::{Batch, Fields, Record, Schema, StageError, StageRole};

use crate::context::StageContext;

/// Produces records from an external source.
#[async_trait]
pub trait Collector: Send {
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Pull the next chunk of payloads.
    ///
    /// Each call yields a finite chunk of a possibly unbounded sequence;
    /// `Ok(None)` means the source is exhausted. The executor stamps every
    /// payload with the collector's name and the next sequence number.
    async fn collect(&mut self, ctx: &StageContext) -> Result<Option<Vec<Fields>>, StageError>;

    async fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Consumes records and emits records (1:1, 1:N, N:1, or filtering).
#[async_trait]
pub trait Processor: Send {
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Transform one input batch.
    ///
    /// Outside batch mode the batch holds a single record. Output records
    /// must be derived from input records (`with_field`, `map_fields`, ...)
    /// so their identity survives. Returning an empty batch filters.
    async fn process(&mut self, ctx: &StageContext, batch: Batch) -> Result<Batch, StageError>;

    /// Emit trailing output once every upstream edge has ended.
    async fn finish(&mut self, _ctx: &StageContext) -> Result<Batch, StageError> {
        Ok(Vec::new())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Consumes records and performs a terminal effect.
#[async_trait]
pub trait Sink: Send {
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Deliver a batch. A successful return means every record in it was
    /// accepted.
    async fn write(&mut self, ctx: &StageContext, batch: &[Record]) -> Result<(), StageError>;

    async fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// A constructed stage of any role.
pub enum StageInstance {
    Collector(Box<dyn Collector>),
    Processor(Box<dyn Processor>),
    Sink(Box<dyn Sink>),
}

impl StageInstance {
    pub fn collector(stage: impl Collector + 'static) -> Self {
        Self::Collector(Box::new(stage))
    }

    pub fn processor(stage: impl Processor + 'static) -> Self {
        Self::Processor(Box::new(stage))
    }

    pub fn sink(stage: impl Sink + 'static) -> Self {
        Self::Sink(Box::new(stage))
    }

    #[must_use]
    pub fn role(&self) -> StageRole {
        match self {
            Self::Collector(_) => StageRole::Collector,
            Self::Processor(_) => StageRole::Processor,
            Self::Sink(_) => StageRole::Sink,
        }
    }

    pub async fn open(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        match self {
            Self::Collector(s) => s.open(ctx).await,
            Self::Processor(s) => s.open(ctx).await,
            Self::Sink(s) => s.open(ctx).await,
        }
    }

    pub async fn close(&mut self) -> Result<(), StageError> {
        match self {
            Self::Collector(s) => s.close().await,
            Self::Processor(s) => s.close().await,
            Self::Sink(s) => s.close().await,
        }
    }
}

impl std::fmt::Debug for StageInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StageInstance").field(&self.role()).finish()
    }
}

/// Static facts a stage type declares when it is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub role: StageRole,
    /// Records this stage accepts. `None` accepts anything.
    pub input_schema: Option<Schema>,
    /// Records this stage emits. `None` makes no promise.
    pub output_schema: Option<Schema>,
    /// Whether re-invoking a call with the same input is safe. Automatic
    /// retry is disabled for non-idempotent stages.
    pub idempotent: bool,
}

impl StageDescriptor {
    #[must_use]
    pub fn new(role: StageRole) -> Self {
        Self {
            role,
            input_schema: None,
            output_schema: None,
            idempotent: true,
        }
    }

    #[must_use]
    pub fn collector() -> Self {
        Self::new(StageRole::Collector)
    }

    #[must_use]
    pub fn processor() -> Self {
        Self::new(StageRole::Processor)
    }

    #[must_use]
    pub fn sink() -> Self {
        Self::new(StageRole::Sink)
    }

    #[must_use]
    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// Constructor for a stage type, fed the stage's free-form `config` block.
///
/// Called once per worker. Constructors should only parse configuration;
/// connections and handles belong in `open`.
pub type StageFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<StageInstance, StageError> + Send + Sync>;
