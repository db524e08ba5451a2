//! Pipeline builder and executor for lubrikit.
//!
//! Build a [`Pipeline`] with [`PipelineBuilder`] against a [`Registry`] of
//! stage types, then drive it with an [`Executor`]:
//!
//! ```ignore
//! let pipeline = PipelineBuilder::from_yaml_str(yaml)?.registry(&registry).build()?;
//! let report = Executor::new(pipeline).run().await?;
//! ```

pub mod builder;
pub(crate) mod checkpoint;
pub mod config;
pub(crate) mod dlq;
pub mod errors;
pub mod events;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub(crate) mod queue;
pub mod registry;
pub mod result;
pub(crate) mod worker;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export public API for convenience
pub use builder::{build_pipeline, PipelineBuilder};
pub use errors::{ConfigurationError, PipelineError, RetryRecord, StageFailure};
pub use events::{EventSink, MemoryEventSink, PipelineEvent, TracingEventSink};
pub use executor::{run_pipeline, Executor};
pub use pipeline::{Pipeline, StageIdx};
pub use registry::{Registry, RegistryBuilder};
pub use result::{EdgeMetric, RunReport};
