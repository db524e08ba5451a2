//! Checkpoint coordination.
//!
//! A single coordinator task owns the checkpoint ledger. Workers report how
//! many in-flight copies of a record they created ([`AckSender::enqueued`])
//! and how many they finished with ([`AckSender::settled`]). Once every copy
//! of a record is accepted, dropped, filtered or dead-lettered, the record
//! is settled; the per-collector watermark advances over contiguous settled
//! sequence numbers and is persisted through the [`StateBackend`].
//!
//! Workers always report new copies before settling the copy that produced
//! them, so a record's count never reaches zero while a descendant is still
//! in flight.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use lubrikit_state::StateBackend;
use lubrikit_types::state::{CollectorName, PipelineId};
use lubrikit_types::RecordId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::PipelineError;
use crate::events::{EventSink, PipelineEvent};

#[derive(Debug)]
enum Ack {
    Enqueued(RecordId, u32),
    Settled(RecordId, u32),
}

/// Cloneable handle workers use to report record copies.
#[derive(Debug, Clone)]
pub(crate) struct AckSender {
    tx: mpsc::UnboundedSender<Ack>,
}

impl AckSender {
    /// `copies` new in-flight copies of `id` now exist.
    pub(crate) fn enqueued(&self, id: &RecordId, copies: u32) {
        if copies > 0 {
            // The coordinator only stops after every sender is gone.
            let _ = self.tx.send(Ack::Enqueued(id.clone(), copies));
        }
    }

    /// `copies` in-flight copies of `id` reached a final outcome.
    pub(crate) fn settled(&self, id: &RecordId, copies: u32) {
        if copies > 0 {
            let _ = self.tx.send(Ack::Settled(id.clone(), copies));
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    watermark: u64,
    persisted: u64,
    outstanding: HashMap<u64, u32>,
    settled: BTreeSet<u64>,
}

impl Ledger {
    fn starting_at(checkpoint: u64) -> Self {
        Self {
            watermark: checkpoint,
            persisted: checkpoint,
            ..Self::default()
        }
    }

    fn enqueued(&mut self, sequence: u64, copies: u32) {
        if sequence <= self.watermark || self.settled.contains(&sequence) {
            return;
        }
        *self.outstanding.entry(sequence).or_default() += copies;
    }

    /// Returns whether the watermark moved, or `Err` when more copies settle
    /// than were ever reported. Late copies of an already settled record
    /// (trailing output of an aggregating processor) are ignored.
    fn settled(&mut self, sequence: u64, copies: u32) -> Result<bool, String> {
        if sequence <= self.watermark || self.settled.contains(&sequence) {
            return Ok(false);
        }
        let Some(count) = self.outstanding.get_mut(&sequence) else {
            return Err(format!("sequence {sequence} settled without being enqueued"));
        };
        if copies > *count {
            return Err(format!(
                "sequence {sequence} settled {copies} copies but only {count} were in flight"
            ));
        }
        *count -= copies;
        if *count > 0 {
            return Ok(false);
        }
        self.outstanding.remove(&sequence);
        self.settled.insert(sequence);

        let before = self.watermark;
        while self.settled.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
        Ok(self.watermark > before)
    }
}

/// Owner of the per-collector checkpoint ledgers.
pub(crate) struct CheckpointCoordinator {
    pipeline: PipelineId,
    backend: Arc<dyn StateBackend>,
    events: Arc<dyn EventSink>,
    interval: u64,
    ledgers: BTreeMap<String, Ledger>,
}

impl CheckpointCoordinator {
    /// `checkpoints` holds the persisted watermark of every collector.
    pub(crate) fn new(
        pipeline: PipelineId,
        backend: Arc<dyn StateBackend>,
        events: Arc<dyn EventSink>,
        interval: u64,
        checkpoints: &BTreeMap<String, u64>,
    ) -> Self {
        Self {
            pipeline,
            backend,
            events,
            interval: interval.max(1),
            ledgers: checkpoints
                .iter()
                .map(|(name, seq)| (name.clone(), Ledger::starting_at(*seq)))
                .collect(),
        }
    }

    /// Start the coordinator. It runs until every [`AckSender`] is dropped
    /// and returns the final watermark of every collector.
    pub(crate) fn spawn(
        self,
    ) -> (
        AckSender,
        JoinHandle<Result<BTreeMap<String, u64>, PipelineError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (AckSender { tx }, handle)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Ack>,
    ) -> Result<BTreeMap<String, u64>, PipelineError> {
        let mut first_error: Option<PipelineError> = None;

        while let Some(ack) = rx.recv().await {
            let (id, advanced) = match ack {
                Ack::Enqueued(id, copies) => {
                    self.ledger(&id.origin).enqueued(id.sequence, copies);
                    continue;
                }
                Ack::Settled(id, copies) => {
                    let advanced = self.ledger(&id.origin).settled(id.sequence, copies);
                    (id, advanced)
                }
            };
            match advanced {
                Ok(false) => {}
                Ok(true) => {
                    let watermark = self.ledger(&id.origin).watermark;
                    self.events.emit(&PipelineEvent::CheckpointAdvanced {
                        collector: id.origin.clone(),
                        sequence: watermark,
                    });
                    if first_error.is_none() && self.due(&id.origin) {
                        if let Err(e) = self.persist(&id.origin).await {
                            tracing::error!(
                                collector = id.origin.as_str(),
                                error = %e,
                                "Failed to persist checkpoint"
                            );
                            first_error = Some(e);
                        }
                    }
                }
                Err(violation) => {
                    tracing::error!(
                        collector = id.origin.as_str(),
                        violation = violation.as_str(),
                        "Checkpoint ledger violation"
                    );
                    if first_error.is_none() {
                        first_error = Some(PipelineError::fault(violation));
                    }
                }
            }
        }

        if first_error.is_none() {
            let names: Vec<String> = self.ledgers.keys().cloned().collect();
            for name in names {
                if let Err(e) = self.persist(&name).await {
                    first_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(self
            .ledgers
            .iter()
            .map(|(name, ledger)| (name.clone(), ledger.watermark))
            .collect())
    }

    fn ledger(&mut self, collector: &str) -> &mut Ledger {
        self.ledgers.entry(collector.to_string()).or_default()
    }

    fn due(&mut self, collector: &str) -> bool {
        let interval = self.interval;
        let ledger = self.ledger(collector);
        ledger.watermark - ledger.persisted >= interval
    }

    async fn persist(&mut self, collector: &str) -> Result<(), PipelineError> {
        let ledger = self.ledger(collector);
        if ledger.watermark == ledger.persisted {
            return Ok(());
        }
        let sequence = ledger.watermark;

        let backend = self.backend.clone();
        let pipeline = self.pipeline.clone();
        let name = CollectorName::new(collector);
        tokio::task::spawn_blocking(move || backend.advance_checkpoint(&pipeline, &name, sequence))
            .await
            .map_err(|e| {
                PipelineError::Infrastructure(anyhow::anyhow!("Checkpoint task panicked: {e}"))
            })?
            .map_err(|e| PipelineError::Infrastructure(e.into()))?;

        self.ledger(collector).persisted = sequence;
        tracing::debug!(
            pipeline = self.pipeline.as_str(),
            collector,
            sequence,
            "Persisted checkpoint"
        );
        Ok(())
    }
}
