//! Structured pipeline events.
//!
//! The executor reports what happens to records through an [`EventSink`].
//! [`TracingEventSink`] (the default) turns each event into a `tracing`
//! line with structured fields; [`MemoryEventSink`] keeps them for
//! inspection.

use std::sync::Mutex;

use lubrikit_types::{ErrorKind, OverflowPolicy, RecordId};

/// Something observable that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StageOpened {
        stage: String,
        worker: usize,
    },
    StageClosed {
        stage: String,
        worker: usize,
    },
    /// A sink accepted a record.
    RecordAccepted {
        stage: String,
        record: RecordId,
    },
    /// A call failed terminally and its records were dropped or the run halted.
    RecordFailed {
        stage: String,
        records: Vec<RecordId>,
        kind: ErrorKind,
        message: String,
    },
    RetryAttempted {
        stage: String,
        records: Vec<RecordId>,
        /// The attempt that failed (1-based).
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// A producer found a `block` edge full and suspended.
    BackpressureEngaged {
        from: String,
        to: String,
        capacity: usize,
    },
    /// A lossy edge discarded a record.
    RecordDropped {
        from: String,
        to: String,
        record: RecordId,
        policy: OverflowPolicy,
    },
    DeadLettered {
        stage: String,
        record: RecordId,
        kind: ErrorKind,
    },
    /// Every record of `collector` up to `sequence` is settled.
    CheckpointAdvanced {
        collector: String,
        sequence: u64,
    },
}

impl PipelineEvent {
    /// Short stable name of the variant.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StageOpened { .. } => "stage_opened",
            Self::StageClosed { .. } => "stage_closed",
            Self::RecordAccepted { .. } => "record_accepted",
            Self::RecordFailed { .. } => "record_failed",
            Self::RetryAttempted { .. } => "retry_attempted",
            Self::BackpressureEngaged { .. } => "backpressure_engaged",
            Self::RecordDropped { .. } => "record_dropped",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::CheckpointAdvanced { .. } => "checkpoint_advanced",
        }
    }
}

/// Receiver of pipeline events. Called from worker tasks; must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageOpened { stage, worker } => {
                tracing::debug!(stage = stage.as_str(), worker, "Stage opened");
            }
            PipelineEvent::StageClosed { stage, worker } => {
                tracing::debug!(stage = stage.as_str(), worker, "Stage closed");
            }
            PipelineEvent::RecordAccepted { stage, record } => {
                tracing::trace!(stage = stage.as_str(), record = %record, "Record accepted");
            }
            PipelineEvent::RecordFailed {
                stage,
                records,
                kind,
                message,
            } => {
                tracing::warn!(
                    stage = stage.as_str(),
                    records = records.len(),
                    first = records.first().map(ToString::to_string),
                    kind = %kind,
                    error = message.as_str(),
                    "Record failed"
                );
            }
            PipelineEvent::RetryAttempted {
                stage,
                records,
                attempt,
                delay_ms,
                error,
            } => {
                tracing::warn!(
                    stage = stage.as_str(),
                    first = records.first().map(ToString::to_string),
                    attempt,
                    delay_ms,
                    error = error.as_str(),
                    "Retrying stage call"
                );
            }
            PipelineEvent::BackpressureEngaged { from, to, capacity } => {
                tracing::debug!(
                    from = from.as_str(),
                    to = to.as_str(),
                    capacity,
                    "Backpressure engaged"
                );
            }
            PipelineEvent::RecordDropped {
                from,
                to,
                record,
                policy,
            } => {
                tracing::info!(
                    from = from.as_str(),
                    to = to.as_str(),
                    record = %record,
                    policy = %policy,
                    "Record dropped on lossy edge"
                );
            }
            PipelineEvent::DeadLettered {
                stage,
                record,
                kind,
            } => {
                tracing::warn!(
                    stage = stage.as_str(),
                    record = %record,
                    kind = %kind,
                    "Record dead-lettered"
                );
            }
            PipelineEvent::CheckpointAdvanced {
                collector,
                sequence,
            } => {
                tracing::debug!(collector = collector.as_str(), sequence, "Checkpoint advanced");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events received so far, in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events whose [`name`](PipelineEvent::name) equals `name`.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<PipelineEvent> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
