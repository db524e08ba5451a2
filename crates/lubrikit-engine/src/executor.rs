//! Pipeline executor.
//!
//! [`Executor::run`] records a run in the state backend, instantiates every
//! stage worker, wires the bounded edge queues, drives all workers to
//! completion on a shared cancellation token, and reports the outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use lubrikit_sdk::{StageContext, StageInstance};
use lubrikit_state::{SqliteStateBackend, StateBackend};
use lubrikit_types::state::{CollectorName, PipelineId, RunStats, RunStatus};
use lubrikit_types::StageRole;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointCoordinator;
use crate::config::types::{StateBackendKind, StateConfig};
use crate::dlq::DeadLetterStore;
use crate::errors::PipelineError;
use crate::events::{EventSink, TracingEventSink};
use crate::pipeline::Pipeline;
use crate::queue::{EdgeQueue, Inbound, Outbound};
use crate::result::{EdgeMetric, RunReport};
use crate::worker::{RunShared, Worker};

/// Runs a validated [`Pipeline`].
pub struct Executor {
    pipeline: Pipeline,
    backend: Option<Arc<dyn StateBackend>>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Executor {
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            backend: None,
            events: Arc::new(TracingEventSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `backend` instead of the one named by the pipeline's `state`
    /// settings.
    #[must_use]
    pub fn with_state_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Cancel the run when `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this executor's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run the pipeline until every collector is exhausted and every record
    /// is settled, a stage failure halts it, or it is cancelled.
    ///
    /// A cancelled run that hit no failure returns `Ok` with status
    /// [`RunStatus::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if a stage constructor
    /// fails, [`PipelineError::Stage`] when a stage failure halts the run,
    /// [`PipelineError::ExecutorFault`] on a broken internal invariant, and
    /// [`PipelineError::Infrastructure`] on state backend failures.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let pipeline = &self.pipeline;
        let settings = pipeline.settings();
        let pipeline_id = PipelineId::new(pipeline.name());

        let backend = match &self.backend {
            Some(backend) => backend.clone(),
            None => create_state_backend(&settings.state)?,
        };

        let run_id = {
            let pid = pipeline_id.clone();
            with_backend(&backend, move |b| b.start_run(&pid)).await?
        };
        tracing::info!(
            pipeline = pipeline.name(),
            run_id,
            stages = pipeline.stages().len(),
            edges = pipeline.edges().len(),
            "Starting pipeline run"
        );

        let resume = match load_checkpoints(&backend, pipeline, &pipeline_id).await {
            Ok(resume) => resume,
            Err(e) => return Err(finish_failed(&backend, run_id, e).await),
        };

        let instances = match instantiate_all(pipeline) {
            Ok(instances) => instances,
            Err(e) => return Err(finish_failed(&backend, run_id, e).await),
        };

        // Edge queues. Each producer worker holds one sender slot.
        let doorbells: Vec<Arc<Notify>> = pipeline
            .stages()
            .iter()
            .map(|_| Arc::new(Notify::new()))
            .collect();
        let queues: Vec<Arc<EdgeQueue>> = pipeline
            .edges()
            .iter()
            .map(|edge| {
                Arc::new(EdgeQueue::new(
                    edge.capacity,
                    edge.overflow,
                    pipeline.stage(edge.from).policy().concurrency,
                    doorbells[edge.to.index()].clone(),
                ))
            })
            .collect();

        let watermarks: BTreeMap<String, u64> = resume
            .iter()
            .map(|(name, seq)| (name.clone(), seq.unwrap_or(0)))
            .collect();
        let (acks, coordinator) = CheckpointCoordinator::new(
            pipeline_id.clone(),
            backend.clone(),
            self.events.clone(),
            settings.checkpoint_interval,
            &watermarks,
        )
        .spawn();

        let run_token = self.cancel.child_token();
        let dead_letter = settings
            .dead_letter
            .then(|| DeadLetterStore::new(backend.clone(), pipeline_id.clone(), run_id));
        let shared = Arc::new(RunShared::new(self.events.clone(), dead_letter));
        let mut workers: JoinSet<Result<(), PipelineError>> = JoinSet::new();

        for (idx, stage_instances) in pipeline.stage_indices().zip(instances) {
            let node = pipeline.stage(idx);
            let name: Arc<str> = Arc::from(node.name());
            let resume_after = resume.get(node.name()).copied().flatten();
            let sequence = Arc::new(AtomicU64::new(resume_after.unwrap_or(0)));

            for (worker_index, instance) in stage_instances.into_iter().enumerate() {
                let ctx = StageContext::new(pipeline.name(), node.name(), worker_index, run_token.clone())
                    .with_resume_after(resume_after);
                let outbound = node
                    .outbound()
                    .iter()
                    .map(|e| {
                        let to = pipeline.stage(pipeline.edge(*e).to).name();
                        Outbound::new(queues[e.index()].clone(), name.clone(), Arc::from(to))
                    })
                    .collect();

                let mut worker = Worker::new(node, worker_index, instance, ctx, acks.clone(), shared.clone())
                    .with_outbound(outbound);
                if node.role() == StageRole::Collector {
                    worker = worker.with_sequence(sequence.clone());
                } else {
                    let inbound = node.inbound().iter().map(|e| queues[e.index()].clone()).collect();
                    worker = worker.with_inbound(Inbound::new(inbound, doorbells[idx.index()].clone()));
                }
                workers.spawn(worker.run());
            }
        }
        drop(acks);

        let mut first_error = collect_worker_results(workers, &run_token).await;

        let checkpoints = match coordinator.await {
            Ok(Ok(checkpoints)) => checkpoints,
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
                watermarks
            }
            Err(join_err) => {
                first_error.get_or_insert(PipelineError::fault(format!(
                    "checkpoint coordinator panicked: {join_err}"
                )));
                watermarks
            }
        };

        let dead_letters = shared.take_dead_letters();

        let status = if first_error.is_some() {
            RunStatus::Failed
        } else if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let mut stats = shared.counters.snapshot();
        stats.error_message = first_error.as_ref().map(ToString::to_string);

        let duration = started.elapsed();
        tracing::info!(
            pipeline = pipeline.name(),
            run_id,
            status = %status,
            records_collected = stats.records_collected,
            records_delivered = stats.records_delivered,
            records_dropped = stats.records_dropped,
            records_dead_lettered = stats.records_dead_lettered,
            retries = stats.retries,
            duration_secs = duration.as_secs_f64(),
            "Pipeline run finished"
        );

        let completed = {
            let stats = stats.clone();
            with_backend(&backend, move |b| b.complete_run(run_id, status, &stats)).await
        };
        if let Some(e) = first_error {
            return Err(e);
        }
        completed?;

        let edges = pipeline
            .edges()
            .iter()
            .zip(&queues)
            .map(|(edge, queue)| EdgeMetric {
                from: pipeline.stage(edge.from).name().to_string(),
                to: pipeline.stage(edge.to).name().to_string(),
                capacity: queue.capacity(),
                overflow: queue.overflow(),
                high_watermark: queue.high_watermark(),
                dropped: queue.dropped(),
            })
            .collect();

        Ok(RunReport {
            pipeline: pipeline.name().to_string(),
            run_id,
            status,
            stats,
            checkpoints,
            dead_letters,
            duration,
            edges,
        })
    }
}

/// Run `pipeline` with default settings: tracing events and the state
/// backend named by its configuration.
///
/// # Errors
///
/// See [`Executor::run`].
pub async fn run_pipeline(pipeline: Pipeline) -> Result<RunReport, PipelineError> {
    Executor::new(pipeline).run().await
}

/// Open the state backend named by `state`.
///
/// `memory` is an in-process `SQLite` database. `sqlite` opens `connection`,
/// or `~/.lubrikit/state.db` when unset.
pub(crate) fn create_state_backend(state: &StateConfig) -> anyhow::Result<Arc<dyn StateBackend>> {
    let backend = match state.backend {
        StateBackendKind::Memory => {
            SqliteStateBackend::in_memory().context("Failed to open in-memory state DB")?
        }
        StateBackendKind::Sqlite => {
            if let Some(path) = &state.connection {
                SqliteStateBackend::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                let state_path = PathBuf::from(home).join(".lubrikit").join("state.db");
                SqliteStateBackend::open(&state_path).context("Failed to open default state DB")?
            }
        }
    };
    Ok(Arc::new(backend) as Arc<dyn StateBackend>)
}

/// Run a state backend call off the async runtime.
pub(crate) async fn with_backend<T, F>(backend: &Arc<dyn StateBackend>, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StateBackend) -> lubrikit_state::error::Result<T> + Send + 'static,
{
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || f(backend.as_ref()))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("State backend task panicked: {e}")))?
        .map_err(|e| PipelineError::Infrastructure(e.into()))
}

/// Last persisted sequence per collector, `None` if it never checkpointed.
async fn load_checkpoints(
    backend: &Arc<dyn StateBackend>,
    pipeline: &Pipeline,
    pipeline_id: &PipelineId,
) -> Result<BTreeMap<String, Option<u64>>, PipelineError> {
    let mut resume = BTreeMap::new();
    for (_, node) in pipeline.collectors() {
        let pid = pipeline_id.clone();
        let collector = CollectorName::new(node.name());
        let checkpoint = with_backend(backend, move |b| b.get_checkpoint(&pid, &collector)).await?;
        if let Some(cp) = &checkpoint {
            tracing::info!(
                pipeline = pipeline.name(),
                collector = node.name(),
                sequence = cp.sequence,
                "Resuming collector after checkpoint"
            );
        }
        resume.insert(node.name().to_string(), checkpoint.map(|cp| cp.sequence));
    }
    Ok(resume)
}

/// One fresh instance per worker, in stage order. Nothing is spawned unless
/// every constructor succeeds.
fn instantiate_all(pipeline: &Pipeline) -> Result<Vec<Vec<StageInstance>>, PipelineError> {
    pipeline
        .stages()
        .iter()
        .map(|node| {
            (0..node.policy().concurrency)
                .map(|_| node.instantiate())
                .collect::<Result<Vec<_>, _>>()
        })
        .collect()
}

/// Record a run that failed before any worker started.
async fn finish_failed(backend: &Arc<dyn StateBackend>, run_id: i64, error: PipelineError) -> PipelineError {
    let stats = RunStats {
        error_message: Some(error.to_string()),
        ..RunStats::default()
    };
    if let Err(e) = with_backend(backend, move |b| b.complete_run(run_id, RunStatus::Failed, &stats)).await {
        tracing::error!(run_id, error = %e, "Failed to record failed run");
    }
    error
}

/// Wait for every worker. The first failure cancels the rest; they still
/// close their instances before exiting.
async fn collect_worker_results(
    mut workers: JoinSet<Result<(), PipelineError>>,
    run_token: &CancellationToken,
) -> Option<PipelineError> {
    let mut first_error: Option<PipelineError> = None;

    while let Some(joined) = workers.join_next().await {
        let error = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(join_err) => PipelineError::fault(format!("stage worker panicked: {join_err}")),
        };
        if first_error.is_none() {
            tracing::error!("Stage worker failed: {}", error);
            first_error = Some(error);
            run_token.cancel();
        } else {
            tracing::debug!("Additional stage worker failure: {}", error);
        }
    }

    first_error
}
