//! Dead-letter helpers used by workers and the executor.

use std::sync::Arc;

use lubrikit_state::StateBackend;
use lubrikit_types::envelope::{DlqRecord, Timestamp};
use lubrikit_types::state::PipelineId;
use lubrikit_types::{Record, StageError};

use crate::errors::PipelineError;
use crate::executor::with_backend;

/// Capture a record that failed at `stage`.
pub(crate) fn dead_letter(stage: &str, record: &Record, error: &StageError, attempts: u32) -> DlqRecord {
    DlqRecord {
        stage: stage.to_string(),
        origin: record.origin().to_string(),
        sequence: record.sequence(),
        record_json: record.to_json().to_string(),
        error_message: error.to_string(),
        error_kind: error.kind,
        attempts,
        failed_at: Timestamp::now(),
    }
}

/// Dead-letter destination of one run.
///
/// Workers persist each failed batch here before settling it, so a
/// checkpoint never moves past a dead letter that is not stored yet.
#[derive(Clone)]
pub(crate) struct DeadLetterStore {
    backend: Arc<dyn StateBackend>,
    pipeline: PipelineId,
    run_id: i64,
}

impl DeadLetterStore {
    pub(crate) fn new(backend: Arc<dyn StateBackend>, pipeline: PipelineId, run_id: i64) -> Self {
        Self {
            backend,
            pipeline,
            run_id,
        }
    }

    /// Persist `records`, returning how many were stored.
    pub(crate) async fn persist(&self, records: Vec<DlqRecord>) -> Result<u64, PipelineError> {
        if records.is_empty() {
            return Ok(0);
        }
        let dlq_count = records.len();
        let pipeline = self.pipeline.clone();
        let run_id = self.run_id;

        match with_backend(&self.backend, move |b| b.insert_dlq_records(&pipeline, run_id, &records)).await {
            Ok(inserted) => {
                tracing::debug!(
                    pipeline = self.pipeline.as_str(),
                    dlq_records = inserted,
                    "Persisted DLQ records to state backend"
                );
                Ok(inserted)
            }
            Err(e) => {
                tracing::error!(
                    pipeline = self.pipeline.as_str(),
                    dlq_count,
                    error = %e,
                    "Failed to persist DLQ records"
                );
                Err(e)
            }
        }
    }
}
