//! Stage plugin contract for lubrikit pipelines.
//!
//! Stage authors implement one of [`Collector`], [`Processor`], or [`Sink`]
//! and register a [`StageFactory`] with the engine's registry.

pub mod context;
pub mod prelude;
pub mod stage;

pub use async_trait::async_trait;
pub use context::StageContext;
pub use stage::{Collector, Processor, Sink, StageDescriptor, StageFactory, StageInstance};
