//! Shared lubrikit record, schema, error, and state model types.
//!
//! This crate is dependency-boundary-safe for both the stage SDK and the
//! engine.

pub mod envelope;
pub mod error;
pub mod record;
pub mod role;
pub mod schema;
pub mod state;

pub use error::{ErrorKind, StageError};
pub use record::{fields, Batch, Fields, Record, RecordId, Value};
pub use role::{OverflowPolicy, StageRole};
pub use schema::{FieldSpec, FieldType, Schema};
