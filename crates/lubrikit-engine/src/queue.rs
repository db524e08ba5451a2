//! Bounded per-edge record queues.
//!
//! Each edge owns an [`EdgeQueue`] with a fixed capacity and an overflow
//! policy. Producers suspend on a full `block` edge; lossy edges evict or
//! reject instead. All inbound queues of a stage share one doorbell
//! [`Notify`] so a consumer can wait on every upstream edge at once.
//!
//! Waits use the `notified()` + `enable()` pattern: the waiter registers
//! before re-checking the queue, so a `notify_waiters` between the check and
//! the `await` is never lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lubrikit_types::{Batch, OverflowPolicy, Record};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of offering a record to an edge.
#[derive(Debug)]
pub(crate) enum Pushed {
    Enqueued,
    /// `drop_oldest`: the record was enqueued and this one evicted.
    Evicted(Record),
    /// `drop_newest`: the queue was full and the offered record discarded.
    Rejected(Record),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueError {
    Cancelled,
    Poisoned,
}

struct QueueState {
    items: VecDeque<Record>,
    senders: usize,
}

pub(crate) struct EdgeQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    overflow: OverflowPolicy,
    space: Notify,
    doorbell: Arc<Notify>,
    high_watermark: AtomicUsize,
    dropped: AtomicU64,
}

impl EdgeQueue {
    /// `senders` is the number of producer workers; the edge ends once all
    /// of them have called [`close_sender`](Self::close_sender) and the
    /// queue is empty.
    pub(crate) fn new(
        capacity: usize,
        overflow: OverflowPolicy,
        senders: usize,
        doorbell: Arc<Notify>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                senders,
            }),
            capacity: capacity.max(1),
            overflow,
            space: Notify::new(),
            doorbell,
            high_watermark: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Offer a record. Suspends on a full `block` edge until space frees up
    /// or `cancel` fires; `on_stall` runs once when the first wait begins.
    pub(crate) async fn push(
        &self,
        record: Record,
        cancel: &CancellationToken,
        mut on_stall: impl FnMut(),
    ) -> Result<Pushed, QueueError> {
        let mut stalled = false;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.lock()?;
                if state.items.len() < self.capacity {
                    state.items.push_back(record);
                    self.observe_len(state.items.len());
                    drop(state);
                    self.doorbell.notify_waiters();
                    return Ok(Pushed::Enqueued);
                }
                match self.overflow {
                    OverflowPolicy::Block => {}
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(Pushed::Rejected(record));
                    }
                    OverflowPolicy::DropOldest => {
                        let evicted = state.items.pop_front();
                        state.items.push_back(record);
                        drop(state);
                        self.doorbell.notify_waiters();
                        let Some(evicted) = evicted else {
                            return Ok(Pushed::Enqueued);
                        };
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(Pushed::Evicted(evicted));
                    }
                }
            }

            if !stalled {
                stalled = true;
                on_stall();
            }
            tokio::select! {
                () = &mut space => {}
                () = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    pub(crate) fn try_pop(&self) -> Result<Option<Record>, QueueError> {
        let item = self.lock()?.items.pop_front();
        if item.is_some() {
            self.space.notify_waiters();
        }
        Ok(item)
    }

    /// No producer is left and nothing is queued.
    pub(crate) fn is_drained(&self) -> Result<bool, QueueError> {
        let state = self.lock()?;
        Ok(state.senders == 0 && state.items.is_empty())
    }

    pub(crate) fn close_sender(&self) {
        let remaining = match self.state.lock() {
            Ok(mut state) => {
                state.senders = state.senders.saturating_sub(1);
                state.senders
            }
            // A poisoned queue only happens while the run is already halting.
            Err(_) => 0,
        };
        if remaining == 0 {
            self.doorbell.notify_waiters();
        }
    }

    fn observe_len(&self, len: usize) {
        self.high_watermark.fetch_max(len, Ordering::Relaxed);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Largest number of records ever buffered at once.
    pub(crate) fn high_watermark(&self) -> usize {
        self.high_watermark.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().map_or(0, |s| s.items.len())
    }
}

/// Producer-side handle. Dropping it closes this producer's side of the edge.
pub(crate) struct Outbound {
    queue: Arc<EdgeQueue>,
    pub(crate) from: Arc<str>,
    pub(crate) to: Arc<str>,
}

impl Outbound {
    pub(crate) fn new(queue: Arc<EdgeQueue>, from: Arc<str>, to: Arc<str>) -> Self {
        Self { queue, from, to }
    }

    pub(crate) fn queue(&self) -> &EdgeQueue {
        &self.queue
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.queue.close_sender();
    }
}

/// What a consumer got from its inbound edges.
#[derive(Debug)]
pub(crate) enum Received<T> {
    Item(T),
    /// Every inbound edge has ended.
    Ended,
}

/// Consumer-side view over all inbound edges of one stage.
pub(crate) struct Inbound {
    queues: Vec<Arc<EdgeQueue>>,
    doorbell: Arc<Notify>,
    next: usize,
}

impl Inbound {
    pub(crate) fn new(queues: Vec<Arc<EdgeQueue>>, doorbell: Arc<Notify>) -> Self {
        Self {
            queues,
            doorbell,
            next: 0,
        }
    }

    /// Round-robin over inbound edges so no upstream starves another.
    fn try_recv(&mut self) -> Result<Option<Record>, QueueError> {
        let n = self.queues.len();
        for offset in 0..n {
            let q = (self.next + offset) % n;
            if let Some(record) = self.queues[q].try_pop()? {
                self.next = (q + 1) % n;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn all_drained(&self) -> Result<bool, QueueError> {
        for queue in &self.queues {
            if !queue.is_drained()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) async fn recv(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Received<Record>, QueueError> {
        loop {
            let doorbell = Arc::clone(&self.doorbell);
            let bell = doorbell.notified();
            tokio::pin!(bell);
            bell.as_mut().enable();

            if let Some(record) = self.try_recv()? {
                return Ok(Received::Item(record));
            }
            if self.all_drained()? {
                return Ok(Received::Ended);
            }
            tokio::select! {
                () = &mut bell => {}
                () = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Wait for one record, then gather up to `max` records. Without a
    /// `linger` the batch fills up or waits for input to end; with one, a
    /// partial batch is released once it elapses.
    pub(crate) async fn recv_batch(
        &mut self,
        max: usize,
        linger: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Received<Batch>, QueueError> {
        let first = match self.recv(cancel).await? {
            Received::Item(record) => record,
            Received::Ended => return Ok(Received::Ended),
        };
        let mut batch = Vec::new();
        batch.push(first);
        let deadline = linger.map(|d| Instant::now() + d);

        while batch.len() < max {
            let doorbell = Arc::clone(&self.doorbell);
            let bell = doorbell.notified();
            tokio::pin!(bell);
            bell.as_mut().enable();

            if let Some(record) = self.try_recv()? {
                batch.push(record);
                continue;
            }
            if self.all_drained()? {
                break;
            }
            match deadline {
                Some(deadline) => tokio::select! {
                    () = &mut bell => {}
                    () = tokio::time::sleep_until(deadline) => break,
                    () = cancel.cancelled() => return Err(QueueError::Cancelled),
                },
                None => tokio::select! {
                    () = &mut bell => {}
                    () = cancel.cancelled() => return Err(QueueError::Cancelled),
                },
            }
        }
        Ok(Received::Item(batch))
    }
}
