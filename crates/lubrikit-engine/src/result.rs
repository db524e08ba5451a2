//! Pipeline run report types.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lubrikit_types::envelope::DlqRecord;
use lubrikit_types::state::{RunStats, RunStatus};
use lubrikit_types::OverflowPolicy;

/// Outcome of a run that was not halted by a failure.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub pipeline: String,
    pub run_id: i64,
    /// `Completed`, or `Cancelled` when the caller's token fired.
    pub status: RunStatus,
    pub stats: RunStats,
    /// Final watermark per collector.
    pub checkpoints: BTreeMap<String, u64>,
    pub dead_letters: Vec<DlqRecord>,
    pub duration: Duration,
    pub edges: Vec<EdgeMetric>,
}

impl RunReport {
    #[must_use]
    pub fn checkpoint(&self, collector: &str) -> Option<u64> {
        self.checkpoints.get(collector).copied()
    }

    #[must_use]
    pub fn edge(&self, from: &str, to: &str) -> Option<&EdgeMetric> {
        self.edges.iter().find(|e| e.from == from && e.to == to)
    }
}

/// Per-edge queue metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeMetric {
    pub from: String,
    pub to: String,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Most records ever buffered on the edge at once.
    pub high_watermark: usize,
    pub dropped: u64,
}

/// Run-wide counters shared by all workers.
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) collected: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) retries: AtomicU64,
}

impl RunCounters {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RunStats {
        RunStats {
            records_collected: self.collected.load(Ordering::Relaxed),
            records_delivered: self.delivered.load(Ordering::Relaxed),
            records_dropped: self.dropped.load(Ordering::Relaxed),
            records_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            error_message: None,
        }
    }
}
