//! Bounded per-priority queues with drop-on-full
//!
//! Producers never wait: when a queue is at capacity the incoming point is
//! dropped and counted. Each queue has exactly one consumer, the processor
//! for its priority, which awaits [`BoundedQueue::pop`].

use crate::config::QueueCapacities;
use crate::point::{DataPoint, Priority};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::warn;

/// A point waiting for its processor
#[derive(Debug, Clone)]
pub struct Queued {
    pub point: DataPoint,
    pub enqueued_at: Instant,
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Queue was full; the point was discarded
    Dropped,
}

/// Metrics for queue monitoring
#[derive(Default)]
pub struct QueueMetrics {
    /// Total points accepted
    pub enqueued: AtomicU64,
    /// Total points dropped because the queue was full
    pub dropped: AtomicU64,
    /// Total points handed to the processor
    pub dequeued: AtomicU64,
}

/// Thread-safe bounded FIFO for one priority level
pub struct BoundedQueue {
    priority: Priority,
    items: Mutex<VecDeque<Queued>>,
    capacity: usize,
    notify: Notify,
    metrics: QueueMetrics,
}

impl BoundedQueue {
    /// Create a new queue with the given capacity
    pub fn new(priority: Priority, capacity: usize) -> Self {
        Self {
            priority,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            metrics: QueueMetrics::default(),
        }
    }

    /// Append a point without blocking
    ///
    /// Drops the point (not the oldest entry) when the queue is full.
    pub fn push(&self, point: DataPoint) -> EnqueueOutcome {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Dropped;
        }

        items.push_back(Queued {
            point,
            enqueued_at: Instant::now(),
        });
        drop(items);

        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        EnqueueOutcome::Enqueued
    }

    /// Take the oldest point if there is one
    pub fn try_pop(&self) -> Option<Queued> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.metrics.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Wait for the next point
    ///
    /// Intended for the single processor that owns this priority.
    pub async fn pop(&self) -> Queued {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Discard everything still queued, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Get current number of queued points
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get current fill percentage (0.0 - 1.0)
    pub fn fill_ratio(&self) -> f64 {
        let len = self.items.lock().len();
        len as f64 / self.capacity as f64
    }

    pub fn total_enqueued(&self) -> u64 {
        self.metrics.enqueued.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.metrics.dropped.load(Ordering::Relaxed)
    }

    pub fn total_dequeued(&self) -> u64 {
        self.metrics.dequeued.load(Ordering::Relaxed)
    }
}

/// The four priority queues
pub struct PriorityQueues {
    queues: [BoundedQueue; 4],
}

impl PriorityQueues {
    pub fn new(capacities: QueueCapacities) -> Self {
        Self {
            queues: Priority::ALL.map(|p| BoundedQueue::new(p, capacities.for_priority(p))),
        }
    }

    /// Route a point to the queue matching its priority
    ///
    /// Never blocks. A full queue drops the point and logs a warning.
    pub fn enqueue(&self, point: DataPoint) -> EnqueueOutcome {
        let priority = point.priority;
        let queue = self.queue(priority);
        let source = point.source.clone();

        let outcome = queue.push(point);
        if outcome == EnqueueOutcome::Dropped {
            crate::metrics::try_record_dropped(priority);
            warn!(
                priority = %priority,
                source = %source,
                capacity = queue.capacity(),
                dropped_total = queue.total_dropped(),
                "Queue full, data point dropped"
            );
        }
        outcome
    }

    pub fn queue(&self, priority: Priority) -> &BoundedQueue {
        &self.queues[priority.index()]
    }

    /// Current depth per priority
    pub fn depths(&self) -> BTreeMap<Priority, usize> {
        self.queues.iter().map(|q| (q.priority(), q.len())).collect()
    }

    /// Drop counters per priority
    pub fn drops(&self) -> BTreeMap<Priority, u64> {
        self.queues
            .iter()
            .map(|q| (q.priority(), q.total_dropped()))
            .collect()
    }

    /// Total points waiting across all priorities
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(BoundedQueue::len).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::point::DataType;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_point(n: i64, priority: Priority) -> DataPoint {
        DataPoint::new("test", DataType::News, priority, Utc::now()).with_field("n", n)
    }

    fn seq(q: &Queued) -> i64 {
        match q.point.payload.get("n") {
            Some(crate::point::FieldValue::Int(n)) => *n,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_push_and_pop_fifo() {
        let queue = BoundedQueue::new(Priority::Medium, 10);

        for i in 0..5 {
            assert_eq!(queue.push(make_point(i, Priority::Medium)), EnqueueOutcome::Enqueued);
        }
        assert_eq!(queue.len(), 5);

        assert_eq!(seq(&queue.try_pop().unwrap()), 0);
        assert_eq!(seq(&queue.try_pop().unwrap()), 1);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_overflow_drops_newest() {
        let queue = BoundedQueue::new(Priority::Low, 3);

        let outcomes: Vec<_> = (0..4).map(|i| queue.push(make_point(i, Priority::Low))).collect();

        assert_eq!(outcomes[3], EnqueueOutcome::Dropped);
        assert_eq!(queue.total_dropped(), 1);
        assert_eq!(queue.len(), 3);

        // Oldest entries kept
        assert_eq!(seq(&queue.try_pop().unwrap()), 0);
        assert_eq!(seq(&queue.try_pop().unwrap()), 1);
        assert_eq!(seq(&queue.try_pop().unwrap()), 2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_drop_accounting_per_priority() {
        let queues = PriorityQueues::new(QueueCapacities::uniform(5));

        for i in 0..6 {
            queues.enqueue(make_point(i, Priority::High));
        }
        queues.enqueue(make_point(0, Priority::Low));

        let drops = queues.drops();
        assert_eq!(drops[&Priority::High], 1);
        assert_eq!(drops[&Priority::Low], 0);
        assert_eq!(drops[&Priority::Critical], 0);

        let depths = queues.depths();
        assert_eq!(depths[&Priority::High], 5);
        assert_eq!(depths[&Priority::Low], 1);
        assert_eq!(queues.total_len(), 6);
    }

    #[test]
    fn test_clear() {
        let queue = BoundedQueue::new(Priority::High, 10);
        for i in 0..4 {
            queue.push(make_point(i, Priority::High));
        }
        assert_eq!(queue.clear(), 4);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fill_ratio() {
        let queue = BoundedQueue::new(Priority::High, 100);
        for i in 0..50 {
            queue.push(make_point(i, Priority::High));
        }
        assert!((queue.fill_ratio() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(BoundedQueue::new(Priority::Critical, 10));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(make_point(9, Priority::Critical));

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop should wake")
            .unwrap();
        assert_eq!(seq(&item), 9);
        assert_eq!(queue.total_dequeued(), 1);
    }

    #[test]
    fn test_push_never_blocks_when_full() {
        let queue = BoundedQueue::new(Priority::Low, 1);
        queue.push(make_point(0, Priority::Low));

        let start = Instant::now();
        for i in 0..10_000 {
            queue.push(make_point(i, Priority::Low));
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.total_dropped(), 10_000);
    }
}
