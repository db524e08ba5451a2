//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for collector checkpoints,
//! run history, and dead-letter queue records. Model types live in
//! [`lubrikit_types::state`].

use lubrikit_types::envelope::DlqRecord;
use lubrikit_types::state::{CheckpointState, CollectorName, PipelineId, RunStats, RunStatus};

use crate::error;

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Read the checkpoint for a (pipeline, collector) pair.
    ///
    /// Returns `Ok(None)` when no checkpoint has been persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_checkpoint(
        &self,
        pipeline: &PipelineId,
        collector: &CollectorName,
    ) -> error::Result<Option<CheckpointState>>;

    /// Upsert the checkpoint for a (pipeline, collector) pair unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_checkpoint(
        &self,
        pipeline: &PipelineId,
        collector: &CollectorName,
        checkpoint: &CheckpointState,
    ) -> error::Result<()>;

    /// Move the checkpoint forward to `sequence`, never backward.
    ///
    /// Returns `true` if the stored value changed, `false` if it was already
    /// at or beyond `sequence`. Inserts when no checkpoint exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn advance_checkpoint(
        &self,
        pipeline: &PipelineId,
        collector: &CollectorName,
        sequence: u64,
    ) -> error::Result<bool>;

    /// Begin a new pipeline run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Persist dead-letter queue records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64>;

    /// Load the dead-letter records stored for a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_dlq_records(&self, pipeline: &PipelineId, run_id: i64)
        -> error::Result<Vec<DlqRecord>>;
}
