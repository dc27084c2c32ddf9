//! Priority-ordered admission queue.
//!
//! Requests that cannot be admitted immediately but whose rule queues them
//! are held here in four strict-priority FIFO buckets. A single-flight drain
//! task pops the head of the highest non-empty bucket and runs the optional
//! downstream processor on it; within a bucket entries are strictly FIFO,
//! across buckets strictly by priority. There is no starvation protection
//! for low-priority entries and no per-entry cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{GatehouseError, Result};

use super::context::RequestContext;

/// Default cap on total pending entries across all buckets.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// The external handler invoked on each drained entry.
///
/// Errors are routed to that entry's completion channel only; they never
/// abort the drain loop.
#[async_trait]
pub trait DownstreamProcessor: Send + Sync {
    /// Perform the throttled work for one admitted context.
    async fn process(&self, ctx: &RequestContext) -> Result<()>;
}

/// A pending admission wrapped with its completion channel.
struct QueueEntry {
    ctx: RequestContext,
    completion: oneshot::Sender<Result<()>>,
    #[allow(dead_code)]
    enqueued_at_ms: u64,
}

/// Four strict-priority FIFO buckets, highest first.
#[derive(Default)]
struct Buckets {
    lanes: [VecDeque<QueueEntry>; 4],
}

impl Buckets {
    fn total(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn push(&mut self, entry: QueueEntry) {
        let index = entry.ctx.priority.bucket_index();
        self.lanes[index].push_back(entry);
    }

    /// Pop the head of the highest non-empty bucket.
    fn pop_next(&mut self) -> Option<QueueEntry> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut entries = Vec::with_capacity(self.total());
        for lane in &mut self.lanes {
            entries.extend(lane.drain(..));
        }
        entries
    }
}

/// In-memory holding area for queued requests.
///
/// Thread-safe; `enqueue` may be called concurrently with a running drain.
pub struct AdmissionQueue {
    buckets: Mutex<Buckets>,
    max_size: usize,
    /// Single-flight guard: only one drain task runs at a time.
    draining: AtomicBool,
    processor: Option<Arc<dyn DownstreamProcessor>>,
}

impl AdmissionQueue {
    /// Create a queue with the given capacity and optional downstream
    /// processor.
    pub fn new(max_size: usize, processor: Option<Arc<dyn DownstreamProcessor>>) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            max_size,
            draining: AtomicBool::new(false),
            processor,
        }
    }

    /// Total pending entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().total()
    }

    /// Whether no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a context to its priority bucket and trigger the drain task.
    ///
    /// Returns the completion channel for the entry, or
    /// [`GatehouseError::QueueFull`] without mutating any bucket when the
    /// queue is at capacity. The receiver resolves with the downstream
    /// processor's outcome once the entry is drained, or with
    /// [`GatehouseError::QueueCleared`] if the queue is cleared first.
    pub fn enqueue(
        self: &Arc<Self>,
        ctx: RequestContext,
        now_ms: u64,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();

        {
            let mut buckets = self.buckets.lock();
            if buckets.total() >= self.max_size {
                warn!(capacity = self.max_size, "Admission queue is full");
                return Err(GatehouseError::QueueFull {
                    capacity: self.max_size,
                });
            }

            trace!(
                request_id = %ctx.id,
                priority = %ctx.priority,
                pending = buckets.total(),
                "Enqueueing request"
            );
            buckets.push(QueueEntry {
                ctx,
                completion: tx,
                enqueued_at_ms: now_ms,
            });
        }

        self.trigger_drain();
        Ok(rx)
    }

    /// Fail every pending entry with a "queue cleared" condition and empty
    /// all buckets. Entries already handed to the processor are unaffected.
    pub fn clear(&self) {
        let entries = self.buckets.lock().drain_all();
        if !entries.is_empty() {
            debug!(cleared = entries.len(), "Clearing admission queue");
        }
        for entry in entries {
            // Receiver may have been dropped; nothing to do then.
            let _ = entry.completion.send(Err(GatehouseError::QueueCleared));
        }
    }

    /// Start the drain task unless one is already running.
    fn trigger_drain(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
    }

    /// Serially process entries in priority order until the queue is empty.
    async fn drain(self: Arc<Self>) {
        loop {
            let entry = self.buckets.lock().pop_next();

            match entry {
                Some(entry) => {
                    let outcome = match &self.processor {
                        Some(processor) => processor.process(&entry.ctx).await,
                        None => Ok(()),
                    };
                    if let Err(ref e) = outcome {
                        debug!(request_id = %entry.ctx.id, error = %e, "Queued entry failed");
                    }
                    let _ = entry.completion.send(outcome);
                }
                None => {
                    self.draining.store(false, Ordering::SeqCst);
                    // An enqueue may have slipped in between the last pop and
                    // clearing the flag; re-arm instead of stranding it.
                    if self.buckets.lock().total() == 0 {
                        break;
                    }
                    if self
                        .draining
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Priority;
    use parking_lot::Mutex as PlMutex;

    /// Records the order in which contexts are processed.
    struct RecordingProcessor {
        order: PlMutex<Vec<String>>,
    }

    #[async_trait]
    impl DownstreamProcessor for RecordingProcessor {
        async fn process(&self, ctx: &RequestContext) -> Result<()> {
            self.order.lock().push(ctx.operation.clone());
            Ok(())
        }
    }

    /// Fails every context whose operation is "bad".
    struct FlakyProcessor;

    #[async_trait]
    impl DownstreamProcessor for FlakyProcessor {
        async fn process(&self, ctx: &RequestContext) -> Result<()> {
            if ctx.operation == "bad" {
                Err(GatehouseError::Downstream("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn ctx(operation: &str, priority: Priority) -> RequestContext {
        RequestContext::new(operation, "/test").with_priority(priority)
    }

    #[tokio::test]
    async fn test_drains_in_priority_order() {
        let processor = Arc::new(RecordingProcessor {
            order: PlMutex::new(Vec::new()),
        });
        let queue = Arc::new(AdmissionQueue::new(100, Some(processor.clone())));

        // Enqueued low, high, critical, medium; drained critical, high,
        // medium, low. Enqueues are synchronous, so the drain task sees all
        // four buckets populated when it first runs.
        let receivers: Vec<_> = [
            ctx("low", Priority::Low),
            ctx("high", Priority::High),
            ctx("critical", Priority::Critical),
            ctx("medium", Priority::Medium),
        ]
        .into_iter()
        .map(|c| queue.enqueue(c, 0).unwrap())
        .collect();

        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(
            *processor.order.lock(),
            vec!["critical", "high", "medium", "low"]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_bucket() {
        let processor = Arc::new(RecordingProcessor {
            order: PlMutex::new(Vec::new()),
        });
        let queue = Arc::new(AdmissionQueue::new(100, Some(processor.clone())));

        let receivers: Vec<_> = ["first", "second", "third"]
            .into_iter()
            .map(|op| queue.enqueue(ctx(op, Priority::Medium), 0).unwrap())
            .collect();

        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(*processor.order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_capacity_rejects_without_mutation() {
        let queue = Arc::new(AdmissionQueue::new(2, None));

        let _rx1 = queue.enqueue(ctx("a", Priority::Low), 0).unwrap();
        let _rx2 = queue.enqueue(ctx("b", Priority::High), 0).unwrap();
        assert_eq!(queue.len(), 2);

        let overflow = queue.enqueue(ctx("c", Priority::Critical), 0);
        assert!(matches!(
            overflow,
            Err(GatehouseError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_fails_pending_entries() {
        let queue = Arc::new(AdmissionQueue::new(100, None));

        // The drain task has not run yet (no await since enqueue), so all
        // three entries are still pending when the queue is cleared.
        let receivers: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|op| queue.enqueue(ctx(op, Priority::Medium), 0).unwrap())
            .collect();

        queue.clear();
        assert!(queue.is_empty());

        for rx in receivers {
            let outcome = rx.await.unwrap();
            assert!(matches!(outcome, Err(GatehouseError::QueueCleared)));
        }
    }

    #[tokio::test]
    async fn test_downstream_error_does_not_abort_drain() {
        let queue = Arc::new(AdmissionQueue::new(100, Some(Arc::new(FlakyProcessor))));

        let rx_bad = queue.enqueue(ctx("bad", Priority::High), 0).unwrap();
        let rx_good = queue.enqueue(ctx("good", Priority::Low), 0).unwrap();

        let bad = rx_bad.await.unwrap();
        assert!(matches!(bad, Err(GatehouseError::Downstream(_))));

        // The failure above must not strand the lower-priority entry.
        rx_good.await.unwrap().unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_drain_completion() {
        let processor = Arc::new(RecordingProcessor {
            order: PlMutex::new(Vec::new()),
        });
        let queue = Arc::new(AdmissionQueue::new(100, Some(processor.clone())));

        let rx = queue.enqueue(ctx("one", Priority::Medium), 0).unwrap();
        rx.await.unwrap().unwrap();

        // A second round after the drain task exited must re-arm it.
        let rx = queue.enqueue(ctx("two", Priority::Medium), 10).unwrap();
        rx.await.unwrap().unwrap();

        assert_eq!(*processor.order.lock(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_no_processor_resolves_entries() {
        let queue = Arc::new(AdmissionQueue::new(100, None));
        let rx = queue.enqueue(ctx("noop", Priority::Low), 0).unwrap();
        rx.await.unwrap().unwrap();
    }
}
