//! Stage types shared by the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lubrikit_engine::{Executor, MemoryEventSink, Pipeline, PipelineEvent, Registry, RegistryBuilder};
use lubrikit_sdk::prelude::*;

/// How many stage instances were built, opened and closed.
#[derive(Debug, Default)]
pub struct Lifecycle {
    pub created: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Lifecycle {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Shared observation points for one test.
#[derive(Clone, Default)]
pub struct Harness {
    /// `(sink stage, record)` for every accepted record, in write order.
    pub delivered: Arc<Mutex<Vec<(String, Record)>>>,
    pub lifecycle: Arc<Lifecycle>,
    pub events: Arc<MemoryEventSink>,
    sink_failures: Arc<Mutex<HashMap<u64, u32>>>,
    processor_failures: Arc<Mutex<HashMap<u64, u32>>>,
}

fn config_u64(config: &serde_json::Value, key: &str, default: u64) -> u64 {
    config.get(key).and_then(serde_json::Value::as_u64).unwrap_or(default)
}

fn config_kind(config: &serde_json::Value) -> Result<ErrorKind, StageError> {
    match config.get("fail_kind").and_then(serde_json::Value::as_str) {
        None => Ok(ErrorKind::Transient),
        Some(kind) => ErrorKind::from_str(kind).map_err(|e| StageError::permanent("CONFIG", e)),
    }
}

fn error_of(kind: ErrorKind, message: String) -> StageError {
    match kind {
        ErrorKind::Transient => StageError::transient("INJECTED", message),
        ErrorKind::Permanent => StageError::permanent("INJECTED", message),
        ErrorKind::Validation => StageError::validation("INJECTED", message),
    }
}

/// Take one planned failure for `sequence`, if any remain.
fn take_failure(plan: &Mutex<HashMap<u64, u32>>, sequence: u64) -> bool {
    let mut plan = plan.lock().unwrap();
    match plan.get_mut(&sequence) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

pub fn n_of(record: &Record) -> i64 {
    record.get("n").and_then(Value::as_int).unwrap()
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sinks fail `times` times when writing a batch containing `sequence`.
    pub fn fail_sink(&self, sequence: u64, times: u32) {
        self.sink_failures.lock().unwrap().insert(sequence, times);
    }

    /// Make `flaky_double` processors fail transiently `times` times on `sequence`.
    pub fn fail_processor(&self, sequence: u64, times: u32) {
        self.processor_failures.lock().unwrap().insert(sequence, times);
    }

    pub fn delivered(&self) -> Vec<Record> {
        self.delivered.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn delivered_to(&self, sink: &str) -> Vec<Record> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(stage, _)| stage == sink)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn sequences_to(&self, sink: &str) -> Vec<u64> {
        self.delivered_to(sink).iter().map(Record::sequence).collect()
    }

    pub fn events_named(&self, name: &str) -> Vec<PipelineEvent> {
        self.events.named(name)
    }

    /// An executor reporting into this harness's event sink.
    pub fn executor(&self, pipeline: Pipeline) -> Executor {
        Executor::new(pipeline).with_event_sink(self.events.clone())
    }

    pub fn registry(&self) -> Registry {
        let lc = self.lifecycle.clone();
        let collector_lc = lc.clone();
        let pass_lc = lc.clone();
        let double_lc = lc.clone();
        let explode_lc = lc.clone();
        let evens_lc = lc.clone();
        let oddify_lc = lc.clone();
        let label_lc = lc.clone();
        let renumber_lc = lc.clone();
        let sum_lc = lc.clone();
        let recorder_lc = lc.clone();
        let broken_lc = lc;
        let delivered = self.delivered.clone();
        let sink_failures = self.sink_failures.clone();
        let processor_failures = self.processor_failures.clone();

        RegistryBuilder::new()
            .register("sequence", StageDescriptor::collector(), move |config| {
                collector_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::collector(SequenceCollector {
                    next: 1,
                    count: config_u64(config, "count", 5),
                    chunk: config_u64(config, "chunk", 1),
                    delay: Duration::from_millis(config_u64(config, "delay_ms", 0)),
                    lifecycle: collector_lc.clone(),
                }))
            })
            .register("passthrough", StageDescriptor::processor(), move |config| {
                pass_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::from_millis(config_u64(config, "delay_ms", 0)),
                    lifecycle: pass_lc.clone(),
                    failures: None,
                    f: |r: Record| vec![r],
                }))
            })
            .register("flaky_double", StageDescriptor::processor(), move |_| {
                double_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::ZERO,
                    lifecycle: double_lc.clone(),
                    failures: Some(processor_failures.clone()),
                    f: |r: Record| {
                        let n = n_of(&r);
                        vec![r.with_field("n", n * 2)]
                    },
                }))
            })
            .register("explode", StageDescriptor::processor(), move |_| {
                explode_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::ZERO,
                    lifecycle: explode_lc.clone(),
                    failures: None,
                    f: |r: Record| (0..3_i64).map(|copy| r.with_field("copy", copy)).collect(),
                }))
            })
            .register("evens", StageDescriptor::processor(), move |_| {
                evens_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::ZERO,
                    lifecycle: evens_lc.clone(),
                    failures: None,
                    f: |r: Record| if n_of(&r) % 2 == 0 { vec![r] } else { Vec::new() },
                }))
            })
            .register("oddify", StageDescriptor::processor(), move |_| {
                oddify_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::ZERO,
                    lifecycle: oddify_lc.clone(),
                    failures: None,
                    // Odd numbers become strings and no longer match an int schema.
                    f: |r: Record| {
                        let n = n_of(&r);
                        if n % 2 == 1 {
                            vec![r.with_field("n", n.to_string())]
                        } else {
                            vec![r]
                        }
                    },
                }))
            })
            .register("label", StageDescriptor::processor(), move |_| {
                label_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::ZERO,
                    lifecycle: label_lc.clone(),
                    failures: None,
                    // Only even numbers get a label.
                    f: |r: Record| {
                        let n = n_of(&r);
                        if n % 2 == 0 {
                            vec![r.with_field("label", format!("even-{n}"))]
                        } else {
                            vec![r]
                        }
                    },
                }))
            })
            .register("renumber", StageDescriptor::processor(), move |_| {
                renumber_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Map {
                    delay: Duration::ZERO,
                    lifecycle: renumber_lc.clone(),
                    failures: None,
                    // Mints a new identity instead of deriving from its input.
                    f: |r: Record| {
                        let id = RecordId::new(r.origin(), r.sequence() + 100);
                        vec![Record::collected(id, r.fields().clone())]
                    },
                }))
            })
            .register("sum", StageDescriptor::processor(), move |_| {
                sum_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::processor(Sum {
                    total: 0,
                    last: None,
                    lifecycle: sum_lc.clone(),
                }))
            })
            .register("recorder", StageDescriptor::sink(), move |config| {
                recorder_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::sink(Recorder {
                    delivered: delivered.clone(),
                    failures: sink_failures.clone(),
                    fail_kind: config_kind(config)?,
                    panic_at: config.get("panic_at").and_then(serde_json::Value::as_u64),
                    delay: Duration::from_millis(config_u64(config, "delay_ms", 0)),
                    lifecycle: recorder_lc.clone(),
                }))
            })
            .register("broken_open", StageDescriptor::sink(), move |_| {
                broken_lc.created.fetch_add(1, Ordering::SeqCst);
                Ok(StageInstance::sink(BrokenOpen {
                    lifecycle: broken_lc.clone(),
                }))
            })
            .build()
            .unwrap()
    }
}

/// Emits `{"n": i}` for `i` in `1..=count`, `chunk` payloads per call.
struct SequenceCollector {
    next: u64,
    count: u64,
    chunk: u64,
    delay: Duration,
    lifecycle: Arc<Lifecycle>,
}

#[async_trait]
impl Collector for SequenceCollector {
    async fn open(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        self.lifecycle.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(after) = ctx.resume_after() {
            self.next = after + 1;
        }
        Ok(())
    }

    async fn collect(&mut self, _ctx: &StageContext) -> Result<Option<Vec<Fields>>, StageError> {
        if self.next > self.count {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut chunk = Vec::new();
        while self.next <= self.count && (chunk.len() as u64) < self.chunk {
            chunk.push(fields([("n", i64::try_from(self.next).unwrap())]));
            self.next += 1;
        }
        Ok(Some(chunk))
    }

    async fn close(&mut self) -> Result<(), StageError> {
        self.lifecycle.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Applies `f` to every record of a batch.
struct Map<F> {
    delay: Duration,
    lifecycle: Arc<Lifecycle>,
    failures: Option<Arc<Mutex<HashMap<u64, u32>>>>,
    f: F,
}

#[async_trait]
impl<F> Processor for Map<F>
where
    F: Fn(Record) -> Vec<Record> + Send + Sync,
{
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        self.lifecycle.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&mut self, _ctx: &StageContext, batch: Batch) -> Result<Batch, StageError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(plan) = &self.failures {
            if let Some(r) = batch.iter().find(|r| take_failure(plan, r.sequence())) {
                return Err(StageError::transient("FLAKY", format!("flaky on {}", r.id())));
            }
        }
        Ok(batch.into_iter().flat_map(|r| (self.f)(r)).collect())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        self.lifecycle.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sums `n` over all input and emits one record at the end.
struct Sum {
    total: i64,
    last: Option<Record>,
    lifecycle: Arc<Lifecycle>,
}

#[async_trait]
impl Processor for Sum {
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        self.lifecycle.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&mut self, _ctx: &StageContext, batch: Batch) -> Result<Batch, StageError> {
        for record in batch {
            self.total += n_of(&record);
            self.last = Some(record);
        }
        Ok(Vec::new())
    }

    async fn finish(&mut self, _ctx: &StageContext) -> Result<Batch, StageError> {
        Ok(self
            .last
            .take()
            .map(|r| vec![r.with_field("n", self.total)])
            .unwrap_or_default())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        self.lifecycle.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every accepted record; fails on planned sequences and panics on
/// `panic_at`.
struct Recorder {
    delivered: Arc<Mutex<Vec<(String, Record)>>>,
    failures: Arc<Mutex<HashMap<u64, u32>>>,
    fail_kind: ErrorKind,
    panic_at: Option<u64>,
    delay: Duration,
    lifecycle: Arc<Lifecycle>,
}

#[async_trait]
impl Sink for Recorder {
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        self.lifecycle.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, ctx: &StageContext, batch: &[Record]) -> Result<(), StageError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(r) = batch.iter().find(|r| Some(r.sequence()) == self.panic_at) {
            panic!("recorder hit {}", r.id());
        }
        if let Some(r) = batch.iter().find(|r| take_failure(&self.failures, r.sequence())) {
            return Err(error_of(self.fail_kind, format!("write failed on {}", r.id())));
        }
        let mut delivered = self.delivered.lock().unwrap();
        delivered.extend(batch.iter().map(|r| (ctx.stage().to_string(), r.clone())));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        self.lifecycle.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A sink whose `open` always fails.
struct BrokenOpen {
    lifecycle: Arc<Lifecycle>,
}

#[async_trait]
impl Sink for BrokenOpen {
    async fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        self.lifecycle.opened.fetch_add(1, Ordering::SeqCst);
        Err(StageError::permanent("CONNECT", "connection refused"))
    }

    async fn write(&mut self, _ctx: &StageContext, _batch: &[Record]) -> Result<(), StageError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        self.lifecycle.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
