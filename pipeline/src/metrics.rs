//! Prometheus metrics and periodic snapshots for TULVA
//!
//! Two views of the same numbers:
//! - Prometheus counters/gauges behind a global registry, scraped through
//!   [`crate::metrics_server::MetricsServer`]
//! - [`MetricsSnapshot`], built from the pipeline's own counters, logged as
//!   one structured line per period and exposed on a watch channel

use crate::error::{PipelineError, Result};
use crate::pipeline::{PipelineContext, stop_requested};
use crate::point::{DataType, Priority};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram_vec,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serializes registration so concurrent `init` calls never register twice
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// All TULVA metrics
pub struct Metrics {
    /// Points parsed (by stream)
    pub points_received: CounterVec,

    /// Points rejected as duplicates (by stream)
    pub points_deduplicated: CounterVec,

    /// Points dropped on a full queue (by priority)
    pub points_dropped: CounterVec,

    /// Points delivered by processors (by data type, priority)
    pub points_published: CounterVec,

    /// Payloads that failed to parse (by stream)
    pub parse_errors: CounterVec,

    /// Connection attempts that failed (by stream)
    pub connection_errors: CounterVec,

    /// Subscriber or sink failures (by target)
    pub publish_errors: CounterVec,

    /// Current queue depth (by priority)
    pub queue_depth: GaugeVec,

    /// Streams currently connected
    pub active_connections: Gauge,

    /// Stream health (1 = degraded, 0 = healthy)
    pub stream_degraded: GaugeVec,

    /// Enqueue to publish latency (by priority)
    pub processing_latency: HistogramVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            points_received: register_counter_vec!(
                "tulva_points_received_total",
                "Total data points parsed from sources",
                &["stream"]
            )
            .map_err(|e| PipelineError::Metrics(format!("points_received: {e}")))?,

            points_deduplicated: register_counter_vec!(
                "tulva_points_deduplicated_total",
                "Total data points rejected as duplicates",
                &["stream"]
            )
            .map_err(|e| PipelineError::Metrics(format!("points_deduplicated: {e}")))?,

            points_dropped: register_counter_vec!(
                "tulva_points_dropped_total",
                "Total data points dropped because a queue was full",
                &["priority"]
            )
            .map_err(|e| PipelineError::Metrics(format!("points_dropped: {e}")))?,

            points_published: register_counter_vec!(
                "tulva_points_published_total",
                "Total data points delivered to subscribers",
                &["data_type", "priority"]
            )
            .map_err(|e| PipelineError::Metrics(format!("points_published: {e}")))?,

            parse_errors: register_counter_vec!(
                "tulva_parse_errors_total",
                "Total payloads that failed to parse",
                &["stream"]
            )
            .map_err(|e| PipelineError::Metrics(format!("parse_errors: {e}")))?,

            connection_errors: register_counter_vec!(
                "tulva_connection_errors_total",
                "Total failed connection attempts",
                &["stream"]
            )
            .map_err(|e| PipelineError::Metrics(format!("connection_errors: {e}")))?,

            publish_errors: register_counter_vec!(
                "tulva_publish_errors_total",
                "Total subscriber and sink failures",
                &["target"]
            )
            .map_err(|e| PipelineError::Metrics(format!("publish_errors: {e}")))?,

            queue_depth: register_gauge_vec!(
                "tulva_queue_depth",
                "Data points waiting per priority queue",
                &["priority"]
            )
            .map_err(|e| PipelineError::Metrics(format!("queue_depth: {e}")))?,

            active_connections: register_gauge!(
                "tulva_active_connections",
                "Number of streams currently connected"
            )
            .map_err(|e| PipelineError::Metrics(format!("active_connections: {e}")))?,

            stream_degraded: register_gauge_vec!(
                "tulva_stream_degraded",
                "Stream health status (1 = degraded, 0 = healthy)",
                &["stream"]
            )
            .map_err(|e| PipelineError::Metrics(format!("stream_degraded: {e}")))?,

            processing_latency: register_histogram_vec!(
                "tulva_processing_latency_seconds",
                "Time from enqueue to publish completion",
                &["priority"],
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
            )
            .map_err(|e| PipelineError::Metrics(format!("processing_latency: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| PipelineError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_received(&self, stream: &str, count: u64) {
        self.points_received
            .with_label_values(&[stream])
            .inc_by(count as f64);
    }

    pub fn record_duplicate(&self, stream: &str) {
        self.points_deduplicated.with_label_values(&[stream]).inc();
    }

    pub fn record_dropped(&self, priority: Priority) {
        self.points_dropped
            .with_label_values(&[priority.as_str()])
            .inc();
    }

    pub fn record_published(&self, data_type: DataType, priority: Priority) {
        self.points_published
            .with_label_values(&[data_type.as_str(), priority.as_str()])
            .inc();
    }

    pub fn record_parse_error(&self, stream: &str) {
        self.parse_errors.with_label_values(&[stream]).inc();
    }

    pub fn record_connection_error(&self, stream: &str) {
        self.connection_errors.with_label_values(&[stream]).inc();
    }

    pub fn record_publish_error(&self, target: &str) {
        self.publish_errors.with_label_values(&[target]).inc();
    }

    /// Record enqueue to publish latency
    pub fn record_latency(&self, priority: Priority, latency: Duration) {
        self.processing_latency
            .with_label_values(&[priority.as_str()])
            .observe(latency.as_secs_f64());
    }

    pub fn set_stream_degraded(&self, stream: &str, degraded: bool) {
        self.stream_degraded
            .with_label_values(&[stream])
            .set(if degraded { 1.0 } else { 0.0 });
    }

    /// Mirror a snapshot's gauges
    pub fn observe_snapshot(&self, snapshot: &MetricsSnapshot) {
        for (priority, depth) in &snapshot.queue_depths {
            self.queue_depth
                .with_label_values(&[priority.as_str()])
                .set(*depth as f64);
        }
        self.active_connections
            .set(snapshot.active_connections as f64);
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_received(stream: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_received(stream, count);
    }
}

pub fn try_record_duplicate(stream: &str) {
    if let Some(m) = Metrics::get() {
        m.record_duplicate(stream);
    }
}

pub fn try_record_dropped(priority: Priority) {
    if let Some(m) = Metrics::get() {
        m.record_dropped(priority);
    }
}

pub fn try_record_published(data_type: DataType, priority: Priority) {
    if let Some(m) = Metrics::get() {
        m.record_published(data_type, priority);
    }
}

pub fn try_record_parse_error(stream: &str) {
    if let Some(m) = Metrics::get() {
        m.record_parse_error(stream);
    }
}

pub fn try_record_connection_error(stream: &str) {
    if let Some(m) = Metrics::get() {
        m.record_connection_error(stream);
    }
}

pub fn try_record_publish_error(target: &str) {
    if let Some(m) = Metrics::get() {
        m.record_publish_error(target);
    }
}

pub fn try_record_latency(priority: Priority, latency: Duration) {
    if let Some(m) = Metrics::get() {
        m.record_latency(priority, latency);
    }
}

pub fn try_set_stream_degraded(stream: &str, degraded: bool) {
    if let Some(m) = Metrics::get() {
        m.set_stream_degraded(stream, degraded);
    }
}

/// Point-in-time view of pipeline counters
///
/// Counters are cumulative since start; depths and connections are current.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub points_received: u64,
    pub points_processed: u64,
    pub points_deduplicated: u64,
    pub queue_depths: BTreeMap<Priority, usize>,
    pub drop_counts: BTreeMap<Priority, u64>,
    pub active_connections: usize,
    /// Connection plus parse errors per stream
    pub error_counts: BTreeMap<String, u64>,
    pub parse_errors: u64,
    pub publish_errors: u64,
    /// Dedup admissions that skipped the cache because it was unavailable
    pub dedup_fail_open: u64,
}

impl MetricsSnapshot {
    pub fn total_dropped(&self) -> u64 {
        self.drop_counts.values().sum()
    }
}

/// Periodically snapshot the pipeline, log it, and publish it on `tx`
///
/// Runs until `shutdown` flips to true. A final snapshot is taken on the
/// way out so the last numbers are never lost.
pub(crate) async fn run_reporter(
    ctx: Arc<PipelineContext>,
    tx: watch::Sender<Option<MetricsSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(ctx.config().metrics_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            _ = ticker.tick() => report(&ctx, &tx),
        }
    }

    report(&ctx, &tx);
    debug!("Metrics reporter stopped");
}

fn report(ctx: &PipelineContext, tx: &watch::Sender<Option<MetricsSnapshot>>) {
    let snapshot = ctx.snapshot();

    if let Some(m) = Metrics::get() {
        m.observe_snapshot(&snapshot);
    }

    match serde_json::to_string(&snapshot) {
        Ok(json) => info!(target: "tulva::metrics", snapshot = %json, "Pipeline metrics"),
        Err(e) => debug!(error = %e, "Failed to serialize metrics snapshot"),
    }

    tx.send_replace(Some(snapshot));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            points_received: 10,
            points_processed: 7,
            points_deduplicated: 2,
            queue_depths: Priority::ALL.into_iter().map(|p| (p, 0)).collect(),
            drop_counts: [(Priority::Critical, 1), (Priority::Low, 2)].into_iter().collect(),
            active_connections: 1,
            error_counts: BTreeMap::new(),
            parse_errors: 0,
            publish_errors: 0,
            dedup_fail_open: 0,
        }
    }

    #[test]
    fn test_metrics_init() {
        // Metrics::init() may fail if already initialized from another test
        // so we just check get() works after any successful init
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.record_received("ticks", 10);
            metrics.record_dropped(Priority::Low);
            metrics.record_latency(Priority::Critical, Duration::from_millis(3));
        }
    }

    #[test]
    fn test_gather_contains_registered_metrics() {
        let _ = Metrics::init();
        try_record_parse_error("gather-test");
        let text = gather();
        assert!(text.contains("tulva_parse_errors_total"));
    }

    #[test]
    fn test_snapshot_serializes_priority_keys() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["drop_counts"]["critical"], 1);
        assert_eq!(json["queue_depths"]["low"], 0);
    }

    #[test]
    fn test_total_dropped() {
        assert_eq!(snapshot().total_dropped(), 3);
    }
}
