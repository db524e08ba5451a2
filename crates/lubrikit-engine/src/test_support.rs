//! Small stages shared by the engine's unit tests.

use std::sync::{Arc, Mutex};

use lubrikit_sdk::prelude::*;

use crate::registry::{Registry, RegistryBuilder};

/// Emits `{"n": i}` for `i` in `1..=count`, `chunk` payloads per call.
/// Resumes after the checkpointed sequence.
pub(crate) struct Numbers {
    next: i64,
    count: i64,
    chunk: usize,
}

impl Numbers {
    pub(crate) fn from_config(config: &serde_json::Value) -> Self {
        Self {
            next: 1,
            count: config.get("count").and_then(serde_json::Value::as_i64).unwrap_or(5),
            chunk: config
                .get("chunk")
                .and_then(serde_json::Value::as_u64)
                .map_or(2, |c| usize::try_from(c).unwrap_or(1)),
        }
    }
}

#[async_trait]
impl Collector for Numbers {
    async fn open(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        if let Some(after) = ctx.resume_after() {
            self.next = i64::try_from(after).unwrap_or(i64::MAX).saturating_add(1);
        }
        Ok(())
    }

    async fn collect(&mut self, _ctx: &StageContext) -> Result<Option<Vec<Fields>>, StageError> {
        if self.next > self.count {
            return Ok(None);
        }
        let mut chunk = Vec::with_capacity(self.chunk);
        while self.next <= self.count && chunk.len() < self.chunk {
            chunk.push(fields([("n", self.next)]));
            self.next += 1;
        }
        Ok(Some(chunk))
    }
}

/// Doubles the `n` field.
pub(crate) struct Double;

#[async_trait]
impl Processor for Double {
    async fn process(&mut self, _ctx: &StageContext, batch: Batch) -> Result<Batch, StageError> {
        Ok(batch
            .into_iter()
            .map(|r| {
                let n = r.get("n").and_then(Value::as_int).unwrap_or_default();
                r.with_field("n", n * 2)
            })
            .collect())
    }
}

/// Appends every written record to a shared vector.
pub(crate) struct CollectSink {
    pub(crate) out: Arc<Mutex<Vec<Record>>>,
}

#[async_trait]
impl Sink for CollectSink {
    async fn write(&mut self, _ctx: &StageContext, batch: &[Record]) -> Result<(), StageError> {
        self.out.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

pub(crate) fn registry_builder(out: Arc<Mutex<Vec<Record>>>) -> RegistryBuilder {
    RegistryBuilder::new()
        .register("numbers", StageDescriptor::collector(), |config| {
            Ok(StageInstance::collector(Numbers::from_config(config)))
        })
        .register("double", StageDescriptor::processor(), |_| {
            Ok(StageInstance::processor(Double))
        })
        .register("collect", StageDescriptor::sink(), move |_| {
            Ok(StageInstance::sink(CollectSink { out: out.clone() }))
        })
}

pub(crate) fn registry_with_sink(out: Arc<Mutex<Vec<Record>>>) -> Registry {
    registry_builder(out).build().unwrap()
}

pub(crate) fn test_registry() -> Registry {
    registry_with_sink(Arc::new(Mutex::new(Vec::new())))
}
