//! Per-priority processors
//!
//! One processor per priority level pops its queue in FIFO order and hands
//! each point to the publisher. Priorities never wait on each other: a slow
//! subscriber on Low only delays Low.
//!
//! On shutdown a processor keeps draining its queue until the shutdown
//! timeout, then discards whatever is left.

use crate::metrics;
use crate::pipeline::{PipelineContext, stop_requested};
use crate::point::Priority;
use crate::queue::Queued;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// What a processor did over its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorReport {
    pub priority: Priority,
    pub processed: u64,
    /// Points still queued when the drain deadline passed
    pub discarded: usize,
}

/// Run the processor for `priority` until shutdown, then drain
pub(crate) async fn run_processor(
    ctx: Arc<PipelineContext>,
    priority: Priority,
    mut shutdown: watch::Receiver<bool>,
) -> ProcessorReport {
    let queue = ctx.queues().queue(priority);
    let mut processed = 0u64;

    debug!(priority = %priority, capacity = queue.capacity(), "Processor started");

    loop {
        let queued = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            queued = queue.pop() => queued,
        };
        process(&ctx, queued).await;
        processed += 1;
    }

    let deadline = Instant::now() + ctx.config().shutdown_timeout;
    let pending = queue.len();

    let mut in_flight = false;

    let drained = timeout_at(deadline, async {
        while let Some(queued) = queue.try_pop() {
            in_flight = true;
            process(&ctx, queued).await;
            in_flight = false;
            processed += 1;
        }
    })
    .await;

    let discarded = match drained {
        Ok(()) => 0,
        Err(_) => {
            // The point being published when the deadline hit is abandoned too
            let discarded = queue.clear() + usize::from(in_flight);
            warn!(
                priority = %priority,
                discarded = discarded,
                "Shutdown timeout reached, discarding queued points"
            );
            discarded
        }
    };

    info!(
        priority = %priority,
        processed = processed,
        pending_at_shutdown = pending,
        discarded = discarded,
        "Processor stopped"
    );

    ProcessorReport {
        priority,
        processed,
        discarded,
    }
}

/// Publish one point and account for its latency
async fn process(ctx: &PipelineContext, queued: Queued) {
    let Queued { point, enqueued_at } = queued;

    ctx.publisher().publish(&point).await;

    let latency = enqueued_at.elapsed();
    ctx.record_processed();
    metrics::try_record_published(point.data_type, point.priority);
    metrics::try_record_latency(point.priority, latency);

    if point.priority == Priority::Critical && latency > ctx.config().critical_latency_target {
        warn!(
            source = %point.source,
            symbol = ?point.symbol,
            latency_ms = latency_ms(latency),
            target_ms = latency_ms(ctx.config().critical_latency_target),
            "Critical point exceeded latency target"
        );
    }
}

fn latency_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, QueueCapacities};
    use crate::error::SourceError;
    use crate::point::{DataPoint, DataType};
    use crate::publish::{FnSubscriber, Subscriber};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    fn point(n: i64, priority: Priority) -> DataPoint {
        DataPoint::new("test", DataType::News, priority, Utc::now()).with_field("n", n)
    }

    fn ctx(shutdown_timeout: Duration) -> Arc<PipelineContext> {
        let config = PipelineConfig {
            queue_capacity: QueueCapacities::uniform(100),
            shutdown_timeout,
            ..PipelineConfig::default()
        };
        Arc::new(PipelineContext::for_tests(config))
    }

    #[tokio::test]
    async fn test_processes_in_fifo_order() {
        let ctx = ctx(Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.publisher().subscribe(
            DataType::News,
            Arc::new(FnSubscriber::new("order", move |p: &DataPoint| {
                sink.lock().push(p.payload["n"].as_f64().unwrap_or_default() as i64);
                Ok(())
            })),
        );

        for n in 0..5 {
            ctx.queues().enqueue(point(n, Priority::High));
        }

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_processor(Arc::clone(&ctx), Priority::High, rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(report.processed, 5);
        assert_eq!(report.discarded, 0);
        assert_eq!(ctx.points_processed(), 5);
    }

    #[tokio::test]
    async fn test_drain_stops_at_deadline() {
        struct Slow;

        #[async_trait]
        impl Subscriber for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn on_event(&self, _point: &DataPoint) -> Result<(), SourceError> {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(())
            }
        }

        let ctx = ctx(Duration::from_millis(100));
        ctx.publisher().subscribe(DataType::News, Arc::new(Slow));

        // Signal shutdown before the processor starts so everything is drained
        let (tx, rx) = watch::channel(true);
        for n in 0..20 {
            ctx.queues().enqueue(point(n, Priority::Low));
        }

        let started = std::time::Instant::now();
        let report = run_processor(Arc::clone(&ctx), Priority::Low, rx).await;
        drop(tx);

        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(report.discarded > 0);
        assert_eq!(report.processed as usize + report.discarded, 20);
        assert!(ctx.queues().queue(Priority::Low).is_empty());
    }

    #[tokio::test]
    async fn test_priorities_are_independent() {
        let ctx = ctx(Duration::from_secs(1));
        ctx.queues().enqueue(point(1, Priority::Critical));
        ctx.queues().enqueue(point(2, Priority::Low));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_processor(Arc::clone(&ctx), Priority::Critical, rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ctx.queues().queue(Priority::Critical).is_empty());
        assert_eq!(ctx.queues().queue(Priority::Low).len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
