//! Stage workers.
//!
//! A [`Worker`] drives one stage instance: it opens the instance, pulls
//! records from the stage's inbound edges (or from the collector), invokes
//! the stage with retry and timeout, routes failures, fans results out to
//! every outbound edge, and finally closes the instance exactly once.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use lubrikit_sdk::{StageContext, StageDescriptor, StageInstance};
use lubrikit_types::envelope::DlqRecord;
use lubrikit_types::{Batch, ErrorKind, Fields, Record, RecordId, Schema, StageError, StageRole};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::AckSender;
use crate::dlq::{dead_letter, DeadLetterStore};
use crate::errors::{compute_backoff, PipelineError, RetryRecord, StageFailure};
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::{StageNode, StagePolicy};
use crate::queue::{Inbound, Outbound, Pushed, QueueError, Received};
use crate::result::RunCounters;

/// State shared by every worker of a run.
pub(crate) struct RunShared {
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) counters: RunCounters,
    /// Dead letters stored so far, in failure order.
    pub(crate) dead_letters: Mutex<Vec<DlqRecord>>,
    /// Set when failed records are dead-lettered instead of halting.
    pub(crate) dead_letter: Option<DeadLetterStore>,
}

impl RunShared {
    pub(crate) fn new(events: Arc<dyn EventSink>, dead_letter: Option<DeadLetterStore>) -> Self {
        Self {
            events,
            counters: RunCounters::default(),
            dead_letters: Mutex::new(Vec::new()),
            dead_letter,
        }
    }

    pub(crate) fn take_dead_letters(&self) -> Vec<DlqRecord> {
        self.dead_letters
            .lock()
            .map(|mut records| std::mem::take(&mut *records))
            .unwrap_or_default()
    }
}

/// Why a worker loop stopped early.
enum Interrupt {
    Cancelled,
    Failed(PipelineError),
}

impl From<PipelineError> for Interrupt {
    fn from(e: PipelineError) -> Self {
        Self::Failed(e)
    }
}

impl From<QueueError> for Interrupt {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Cancelled => Self::Cancelled,
            QueueError::Poisoned => Self::Failed(PipelineError::fault("edge queue lock poisoned")),
        }
    }
}

/// One invocation of a stage.
enum Call<'a> {
    Collect,
    Process(&'a [Record]),
    Finish,
    Write(&'a [Record]),
}

enum CallOutput {
    Collected(Option<Vec<Fields>>),
    Records(Batch),
    Written,
}

async fn call_once(
    instance: &mut StageInstance,
    ctx: &StageContext,
    call: &Call<'_>,
) -> Result<CallOutput, StageError> {
    match (instance, call) {
        (StageInstance::Collector(c), Call::Collect) => c.collect(ctx).await.map(CallOutput::Collected),
        (StageInstance::Processor(p), Call::Process(batch)) => {
            p.process(ctx, batch.to_vec()).await.map(CallOutput::Records)
        }
        (StageInstance::Processor(p), Call::Finish) => p.finish(ctx).await.map(CallOutput::Records),
        (StageInstance::Sink(s), Call::Write(batch)) => {
            s.write(ctx, batch).await.map(|()| CallOutput::Written)
        }
        (instance, _) => Err(StageError::permanent(
            "ROLE_MISMATCH",
            format!("call not supported by a {} stage", instance.role()),
        )),
    }
}

/// Result of a call after retries.
struct Attempted {
    output: Result<CallOutput, StageError>,
    attempts: u32,
    history: Vec<RetryRecord>,
}

fn timeout_error(limit: Duration, idempotent: bool) -> StageError {
    let message = format!("stage call exceeded timeout of {}ms", limit.as_millis());
    if idempotent {
        StageError::transient("TIMEOUT", message)
    } else {
        StageError::permanent("TIMEOUT", message)
    }
}

/// A processor output whose identity was never handed to the processor.
fn unknown_identity(record: &Record) -> StageError {
    StageError::permanent(
        "UNKNOWN_IDENTITY",
        format!("output carries identity {} that was not received", record.id()),
    )
}

fn schema_violation(problems: &[String]) -> StageError {
    StageError::validation("SCHEMA_VIOLATION", problems.join("; "))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn ids(records: &[Record]) -> Vec<RecordId> {
    records.iter().map(|r| r.id().clone()).collect()
}

pub(crate) struct Worker {
    stage: String,
    index: usize,
    descriptor: StageDescriptor,
    policy: StagePolicy,
    instance: StageInstance,
    ctx: StageContext,
    inbound: Option<Inbound>,
    outbound: Vec<Outbound>,
    sequence: Option<Arc<AtomicU64>>,
    /// Highest sequence received per origin.
    received: HashMap<String, u64>,
    acks: AckSender,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        node: &StageNode,
        index: usize,
        instance: StageInstance,
        ctx: StageContext,
        acks: AckSender,
        shared: Arc<RunShared>,
    ) -> Self {
        let cancel = ctx.cancellation_token().clone();
        Self {
            stage: node.name().to_string(),
            index,
            descriptor: node.descriptor().clone(),
            policy: node.policy().clone(),
            instance,
            ctx,
            inbound: None,
            outbound: Vec::new(),
            sequence: None,
            received: HashMap::new(),
            acks,
            shared,
            cancel,
        }
    }

    pub(crate) fn with_inbound(mut self, inbound: Inbound) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub(crate) fn with_outbound(mut self, outbound: Vec<Outbound>) -> Self {
        self.outbound = outbound;
        self
    }

    /// Sequence counter shared by all workers of a collector stage. Holds
    /// the last sequence number handed out.
    pub(crate) fn with_sequence(mut self, sequence: Arc<AtomicU64>) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Run the worker to completion. `close` is called exactly once,
    /// whatever happened before.
    pub(crate) async fn run(mut self) -> Result<(), PipelineError> {
        let result = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Interrupt::Failed(PipelineError::fault(format!(
                "stage '{}' worker {} panicked: {}",
                self.stage,
                self.index,
                panic_message(panic.as_ref())
            )))),
        };
        // Downstream may finish while this instance closes.
        self.outbound.clear();

        match AssertUnwindSafe(self.instance.close()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                stage = self.stage.as_str(),
                worker = self.index,
                error = %e,
                "Stage close failed"
            ),
            Err(panic) => tracing::warn!(
                stage = self.stage.as_str(),
                worker = self.index,
                "Stage close panicked: {}",
                panic_message(panic.as_ref())
            ),
        }
        self.emit(PipelineEvent::StageClosed {
            stage: self.stage.clone(),
            worker: self.index,
        });

        match result {
            Ok(()) | Err(Interrupt::Cancelled) => Ok(()),
            Err(Interrupt::Failed(e)) => Err(e),
        }
    }

    async fn drive(&mut self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if let Err(e) = self.instance.open(&self.ctx).await {
            return Err(self.halt(e, None, 1, Vec::new()));
        }
        self.emit(PipelineEvent::StageOpened {
            stage: self.stage.clone(),
            worker: self.index,
        });

        match self.descriptor.role {
            StageRole::Collector => self.run_collector().await,
            StageRole::Processor => self.run_processor().await,
            StageRole::Sink => self.run_sink().await,
        }
    }

    // -----------------------------------------------------------------------
    // Role loops
    // -----------------------------------------------------------------------

    async fn run_collector(&mut self) -> Result<(), Interrupt> {
        let Some(sequence) = self.sequence.clone() else {
            return Err(PipelineError::fault(format!(
                "collector '{}' has no sequence counter",
                self.stage
            ))
            .into());
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            let attempted = self.invoke(Call::Collect, &[]).await?;
            let chunk = match attempted.output {
                Ok(CallOutput::Collected(Some(chunk))) => chunk,
                Ok(CallOutput::Collected(None)) => return Ok(()),
                Ok(_) => return Err(PipelineError::fault("collector returned a non-collect output").into()),
                Err(e) => return Err(self.halt(e, None, attempted.attempts, attempted.history)),
            };
            if chunk.is_empty() {
                continue;
            }

            let records: Batch = chunk
                .into_iter()
                .map(|payload| {
                    let seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    Record::collected(RecordId::new(self.stage.as_str(), seq), payload)
                })
                .collect();
            RunCounters::add(&self.shared.counters.collected, records.len());
            self.emit_outputs(records).await?;
        }
    }

    async fn run_processor(&mut self) -> Result<(), Interrupt> {
        while let Received::Item(batch) = self.next_batch().await? {
            let valid = self.check_inputs(batch).await?;
            if valid.is_empty() {
                continue;
            }

            for record in &valid {
                let high = self.received.entry(record.origin().to_string()).or_insert(0);
                *high = (*high).max(record.sequence());
            }

            let attempted = self.invoke(Call::Process(&valid), &valid).await?;
            match attempted.output {
                Ok(CallOutput::Records(outputs)) => {
                    let inputs: HashSet<&RecordId> = valid.iter().map(Record::id).collect();
                    let forged = outputs.iter().find(|o| !inputs.contains(o.id())).map(unknown_identity);
                    if let Some(error) = forged {
                        self.fail_records(&valid, error, attempted.attempts, attempted.history)
                            .await?;
                    } else {
                        self.emit_outputs(outputs).await?;
                        for record in &valid {
                            self.acks.settled(record.id(), 1);
                        }
                    }
                }
                Ok(_) => return Err(PipelineError::fault("processor returned a non-record output").into()),
                Err(e) => {
                    self.fail_records(&valid, e, attempted.attempts, attempted.history)
                        .await?;
                }
            }
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
        }

        let attempted = self.invoke(Call::Finish, &[]).await?;
        match attempted.output {
            Ok(CallOutput::Records(outputs)) => {
                let forged = outputs
                    .iter()
                    .find(|o| !self.received.get(o.origin()).is_some_and(|high| o.sequence() <= *high))
                    .map(unknown_identity);
                match forged {
                    Some(error) => Err(self.halt(error, None, attempted.attempts, attempted.history)),
                    None => self.emit_outputs(outputs).await,
                }
            }
            Ok(_) => Err(PipelineError::fault("processor returned a non-record output").into()),
            Err(e) => Err(self.halt(e, None, attempted.attempts, attempted.history)),
        }
    }

    async fn run_sink(&mut self) -> Result<(), Interrupt> {
        while let Received::Item(batch) = self.next_batch().await? {
            let valid = self.check_inputs(batch).await?;
            if valid.is_empty() {
                continue;
            }

            let attempted = self.invoke(Call::Write(&valid), &valid).await?;
            match attempted.output {
                Ok(_) => {
                    RunCounters::add(&self.shared.counters.delivered, valid.len());
                    for record in &valid {
                        self.emit(PipelineEvent::RecordAccepted {
                            stage: self.stage.clone(),
                            record: record.id().clone(),
                        });
                        self.acks.settled(record.id(), 1);
                    }
                }
                Err(e) => {
                    self.fail_records(&valid, e, attempted.attempts, attempted.history)
                        .await?;
                }
            }
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
        }
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Received<Batch>, Interrupt> {
        let Some(inbound) = self.inbound.as_mut() else {
            return Err(PipelineError::fault(format!("stage '{}' has no inbound edges", self.stage)).into());
        };
        let received = match self.policy.batch_size {
            Some(max) => inbound.recv_batch(max, self.policy.batch_linger, &self.cancel).await?,
            None => match inbound.recv(&self.cancel).await? {
                Received::Item(record) => Received::Item(vec![record]),
                Received::Ended => Received::Ended,
            },
        };
        Ok(received)
    }

    // -----------------------------------------------------------------------
    // Invocation
    // -----------------------------------------------------------------------

    /// Invoke `call`, retrying transient failures of idempotent stages with
    /// backoff. `records` is the input the call is about.
    async fn invoke(&mut self, call: Call<'_>, records: &[Record]) -> Result<Attempted, Interrupt> {
        let mut attempt: u32 = 0;
        let mut history = Vec::new();

        loop {
            attempt += 1;
            let result = match self.policy.timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, call_once(&mut self.instance, &self.ctx, &call))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(timeout_error(limit, self.descriptor.idempotent)),
                    }
                }
                None => call_once(&mut self.instance, &self.ctx, &call).await,
            };

            let error = match result {
                Ok(output) => {
                    return Ok(Attempted {
                        output: Ok(output),
                        attempts: attempt,
                        history,
                    })
                }
                Err(error) => error,
            };

            let retryable = error.is_transient()
                && self.descriptor.idempotent
                && attempt < self.policy.retry.max_attempts;
            if !retryable {
                return Ok(Attempted {
                    output: Err(error),
                    attempts: attempt,
                    history,
                });
            }

            let delay = compute_backoff(&self.policy.retry, &error, attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(
                stage = self.stage.as_str(),
                worker = self.index,
                attempt,
                max_attempts = self.policy.retry.max_attempts,
                delay_ms,
                error = %error,
                "Transient stage error, retrying"
            );
            RunCounters::add(&self.shared.counters.retries, 1);
            self.emit(PipelineEvent::RetryAttempted {
                stage: self.stage.clone(),
                records: ids(records),
                attempt,
                delay_ms,
                error: error.to_string(),
            });
            history.push(RetryRecord {
                attempt,
                delay,
                error,
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Send records to every outbound edge. Each copy is reported to the
    /// checkpoint coordinator before it is pushed.
    async fn emit_outputs(&mut self, records: Batch) -> Result<(), Interrupt> {
        let records = self.check_outputs(records).await?;
        let copies = u32::try_from(self.outbound.len()).unwrap_or(u32::MAX);
        for record in &records {
            self.acks.enqueued(record.id(), copies);
        }

        for record in records {
            for out in &self.outbound {
                let events = &self.shared.events;
                let pushed = out
                    .queue()
                    .push(record.clone(), &self.cancel, || {
                        events.emit(&PipelineEvent::BackpressureEngaged {
                            from: out.from.to_string(),
                            to: out.to.to_string(),
                            capacity: out.queue().capacity(),
                        });
                    })
                    .await?;
                let dropped = match pushed {
                    Pushed::Enqueued => continue,
                    Pushed::Evicted(dropped) | Pushed::Rejected(dropped) => dropped,
                };
                RunCounters::add(&self.shared.counters.dropped, 1);
                events.emit(&PipelineEvent::RecordDropped {
                    from: out.from.to_string(),
                    to: out.to.to_string(),
                    record: dropped.id().clone(),
                    policy: out.queue().overflow(),
                });
                self.acks.settled(dropped.id(), 1);
            }
        }
        Ok(())
    }

    /// Split off inputs that violate the declared input schema and route
    /// them as validation failures.
    async fn check_inputs(&mut self, batch: Batch) -> Result<Batch, Interrupt> {
        let Some(schema) = self.descriptor.input_schema.clone() else {
            return Ok(batch);
        };
        self.split_invalid(&schema, batch).await
    }

    /// Same for outputs against the declared output schema. Rejected outputs
    /// are reported to the checkpoint coordinator before they are routed.
    async fn check_outputs(&mut self, batch: Batch) -> Result<Batch, Interrupt> {
        let Some(schema) = self.descriptor.output_schema.clone() else {
            return Ok(batch);
        };
        let mut valid = Vec::with_capacity(batch.len());
        for record in batch {
            match schema.validate(&record) {
                Ok(()) => valid.push(record),
                Err(problems) => {
                    self.acks.enqueued(record.id(), 1);
                    self.fail_records(&[record], schema_violation(&problems), 1, Vec::new())
                        .await?;
                }
            }
        }
        Ok(valid)
    }

    async fn split_invalid(&mut self, schema: &Schema, batch: Batch) -> Result<Batch, Interrupt> {
        let mut valid = Vec::with_capacity(batch.len());
        for record in batch {
            match schema.validate(&record) {
                Ok(()) => valid.push(record),
                Err(problems) => {
                    self.fail_records(&[record], schema_violation(&problems), 0, Vec::new())
                        .await?;
                }
            }
        }
        Ok(valid)
    }

    /// Apply the failure policy to the records a failed call was about.
    ///
    /// Validation failures never halt: they are dead-lettered or dropped.
    /// Other failures are dead-lettered when enabled and halt otherwise.
    async fn fail_records(
        &mut self,
        records: &[Record],
        error: StageError,
        attempts: u32,
        history: Vec<RetryRecord>,
    ) -> Result<(), Interrupt> {
        let Some(first) = records.first() else {
            return Err(self.halt(error, None, attempts, history));
        };

        if let Some(store) = &self.shared.dead_letter {
            let letters: Vec<DlqRecord> = records
                .iter()
                .map(|r| dead_letter(&self.stage, r, &error, attempts))
                .collect();
            // Stored before settling, so no checkpoint passes an unstored letter.
            store.persist(letters.clone()).await?;
            match self.shared.dead_letters.lock() {
                Ok(mut dlq) => dlq.extend(letters),
                Err(_) => return Err(PipelineError::fault("dead-letter buffer lock poisoned").into()),
            }
            RunCounters::add(&self.shared.counters.dead_lettered, records.len());
            for record in records {
                self.emit(PipelineEvent::DeadLettered {
                    stage: self.stage.clone(),
                    record: record.id().clone(),
                    kind: error.kind,
                });
                self.acks.settled(record.id(), 1);
            }
            return Ok(());
        }

        self.emit(PipelineEvent::RecordFailed {
            stage: self.stage.clone(),
            records: ids(records),
            kind: error.kind,
            message: error.to_string(),
        });
        if error.kind == ErrorKind::Validation {
            RunCounters::add(&self.shared.counters.dropped, records.len());
            for record in records {
                self.acks.settled(record.id(), 1);
            }
            return Ok(());
        }

        let record = Some(first.id().clone());
        Err(self.halt(error, record, attempts, history))
    }

    fn halt(
        &self,
        error: StageError,
        record: Option<RecordId>,
        attempts: u32,
        retry_history: Vec<RetryRecord>,
    ) -> Interrupt {
        tracing::error!(
            stage = self.stage.as_str(),
            worker = self.index,
            record = record.as_ref().map(ToString::to_string),
            attempts,
            error = %error,
            "Stage failed, halting pipeline"
        );
        Interrupt::Failed(
            StageFailure {
                classification: error.kind,
                stage: self.stage.clone(),
                record,
                error,
                attempts,
                retry_history,
            }
            .into(),
        )
    }

    fn emit(&self, event: PipelineEvent) {
        self.shared.events.emit(&event);
    }
}
