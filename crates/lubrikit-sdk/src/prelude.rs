//! Convenience re-exports for stage authors.
//!
//! ```ignore
//! use lubrikit_sdk::prelude::*;
//! ```

// Stage traits
pub use crate::stage::{Collector, Processor, Sink};
pub use crate::stage::{StageDescriptor, StageFactory, StageInstance};

// Context
pub use crate::context::StageContext;

// Records and schemas
pub use lubrikit_types::{fields, Batch, Fields, Record, RecordId, Value};
pub use lubrikit_types::{FieldSpec, FieldType, Schema, StageRole};

// Errors
pub use lubrikit_types::{ErrorKind, StageError};

pub use async_trait::async_trait;
