//! Per-worker execution context handed to every stage call.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Execution context for one stage worker.
///
/// Cloning is cheap; all clones observe the same cancellation token.
#[derive(Debug, Clone)]
pub struct StageContext {
    pipeline: String,
    stage: String,
    worker: usize,
    resume_after: Option<u64>,
    cancel: CancellationToken,
}

impl StageContext {
    #[must_use]
    pub fn new(
        pipeline: impl Into<String>,
        stage: impl Into<String>,
        worker: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            worker,
            resume_after: None,
            cancel,
        }
    }

    /// Set the last checkpointed sequence number for a collector.
    #[must_use]
    pub fn with_resume_after(mut self, sequence: Option<u64>) -> Self {
        self.resume_after = sequence;
        self
    }

    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Index of this worker among the stage's parallel workers.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Last sequence number this collector had fully processed in a previous
    /// run. Collectors use it to skip data that was already delivered.
    #[must_use]
    pub fn resume_after(&self) -> Option<u64> {
        self.resume_after
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the pipeline is cancelled. Long-running calls can
    /// `select!` on this to stop early.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let token = CancellationToken::new();
        let ctx = StageContext::new("p", "reader", 0, token.clone()).with_resume_after(Some(4));
        let copy = ctx.clone();
        assert!(!copy.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(copy.is_cancelled());
        assert_eq!(copy.resume_after(), Some(4));
    }
}
