//! Pipeline - the central builder and runtime handle for TULVA
//!
//! The Pipeline provides a builder pattern for wiring streams, subscribers
//! and an optional external sink. `start` spawns every task and returns a
//! [`PipelineHandle`] for runtime registration, introspection and shutdown.
//!
//! # Example
//!
//! ```ignore
//! use tulva_pipeline::{Pipeline, StreamDescriptor, DataType, Priority, JsonParser};
//!
//! let handle = Pipeline::new()
//!     .stream(
//!         StreamDescriptor::push("ticks", DataType::MarketData, "wss://feed/ws", Arc::new(JsonParser::new()))
//!             .symbols(["AAPL"])
//!             .priority(Priority::Critical),
//!     )
//!     .subscribe(DataType::MarketData, FnSubscriber::new("print", |p| { println!("{p:?}"); Ok(()) }))
//!     .start()?;
//!
//! // ...
//! let report = handle.shutdown().await;
//! ```
//!
//! # Architecture
//!
//! ```text
//! Supervisor (per stream) ──► Deduplicator ──► PriorityQueues ──► Processor (per priority) ──► Publisher
//!                                   ▲                                                         ├─► Subscribers
//!                              Janitor (sweep)                                                └─► EventSink
//! ```

use crate::config::PipelineConfig;
use crate::credentials::{CredentialResolver, NoCredentials};
use crate::dedup::Deduplicator;
use crate::descriptor::{StreamDescriptor, TransportKind};
use crate::error::{PipelineError, Result};
use crate::health::{HealthReport, HealthThresholds, check_streams, run_monitor};
use crate::janitor::run_janitor;
use crate::metrics::{Metrics, MetricsSnapshot, run_reporter};
use crate::metrics_server::MetricsServer;
use crate::point::{DataType, Priority};
use crate::processor::{ProcessorReport, run_processor};
use crate::publish::{EventSink, Publisher, Subscriber, SubscriptionId};
use crate::queue::PriorityQueues;
use crate::registry::StreamRegistry;
use crate::supervisor::{StreamState, StreamStatus, Supervisor};
use crate::transport::{HttpPollTransport, Transport, WebSocketTransport};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

/// Extra time past the shutdown timeout before tasks are aborted
const STOP_GRACE: Duration = Duration::from_millis(250);

/// Resolve once `rx` reads true or its sender is gone
pub(crate) async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Builder for a pipeline
pub struct Pipeline {
    config: PipelineConfig,
    streams: Vec<StreamDescriptor>,
    subscriptions: Vec<(DataType, Arc<dyn Subscriber>)>,
    sink: Option<Arc<dyn EventSink>>,
    credentials: Arc<dyn CredentialResolver>,
    push_transport: Option<Arc<dyn Transport>>,
    pull_transport: Option<Arc<dyn Transport>>,
    metrics_port: Option<u16>,
}

impl Pipeline {
    /// Create a pipeline with default configuration
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            streams: Vec::new(),
            subscriptions: Vec::new(),
            sink: None,
            credentials: Arc::new(NoCredentials),
            push_transport: None,
            pull_transport: None,
            metrics_port: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a stream at start
    pub fn stream(mut self, descriptor: StreamDescriptor) -> Self {
        self.streams.push(descriptor);
        self
    }

    /// Subscribe to a data type before any point flows
    pub fn subscribe<S: Subscriber + 'static>(mut self, data_type: DataType, subscriber: S) -> Self {
        self.subscriptions.push((data_type, Arc::new(subscriber)));
        self
    }

    /// Subscribe (Arc version)
    pub fn subscribe_arc(mut self, data_type: DataType, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriptions.push((data_type, subscriber));
        self
    }

    /// Publish every point to an external sink as well
    pub fn sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Set the external sink (Arc version)
    pub fn sink_arc(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Where streams get their credentials; defaults to none
    pub fn credentials<C: CredentialResolver + 'static>(mut self, resolver: C) -> Self {
        self.credentials = Arc::new(resolver);
        self
    }

    /// Replace the WebSocket transport used by push streams
    pub fn push_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.push_transport = Some(transport);
        self
    }

    /// Replace the HTTP polling transport used by pull streams
    pub fn pull_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.pull_transport = Some(transport);
        self
    }

    /// Serve `/metrics`, `/health` and `/snapshot` on this port
    pub fn metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    /// Validate, register every stream, and spawn all tasks
    ///
    /// Must be called from within a tokio runtime. Nothing is spawned if
    /// the configuration or any descriptor is invalid.
    pub fn start(self) -> Result<PipelineHandle> {
        self.config.validate()?;
        // Pipelines still run without Prometheus; snapshots cover the same numbers
        if let Err(e) = Metrics::init() {
            warn!(error = %e, "Prometheus metrics unavailable");
        }

        let push: Arc<dyn Transport> = match self.push_transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketTransport::new()),
        };
        let pull: Arc<dyn Transport> = match self.pull_transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpPollTransport::new().map_err(|e| PipelineError::Config(e.to_string()))?,
            ),
        };

        let mut publisher = Publisher::new(self.config.channel_prefix.clone());
        if let Some(sink) = self.sink {
            info!(sink = sink.name(), "Publishing to external sink");
            publisher = publisher.with_sink(sink);
        }
        for (data_type, subscriber) in self.subscriptions {
            publisher.subscribe(data_type, subscriber);
        }

        let ctx = Arc::new(PipelineContext::new(
            self.config,
            publisher,
            self.credentials,
            push,
            pull,
        ));

        let mut initial = Vec::with_capacity(self.streams.len());
        {
            let mut registry = ctx.registry.write();
            for descriptor in self.streams {
                initial.push(registry.register(descriptor)?);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (metrics_tx, metrics_rx) = watch::channel(None);

        let processors = Priority::ALL
            .into_iter()
            .map(|priority| {
                tokio::spawn(run_processor(Arc::clone(&ctx), priority, shutdown_rx.clone()))
            })
            .collect();

        let background = vec![
            ("health", tokio::spawn(run_monitor(Arc::clone(&ctx), shutdown_rx.clone()))),
            ("janitor", tokio::spawn(run_janitor(Arc::clone(&ctx), shutdown_rx.clone()))),
            (
                "reporter",
                tokio::spawn(run_reporter(Arc::clone(&ctx), metrics_tx, shutdown_rx)),
            ),
        ];

        let metrics_server = self
            .metrics_port
            .map(|port| MetricsServer::start(port, Arc::clone(&ctx)));

        let handle = PipelineHandle {
            ctx,
            state: Mutex::new(RunState {
                shutting_down: false,
                supervisors: HashMap::new(),
                processors,
                background,
                metrics_server,
            }),
            shutdown_tx,
            metrics_rx,
        };

        {
            let mut state = handle.state.lock();
            for descriptor in initial.into_iter().filter(|d| d.active) {
                handle.spawn_supervisor(&mut state, descriptor);
            }
        }

        info!(
            streams = handle.ctx.registry.read().len(),
            sink = handle.ctx.publisher.has_sink(),
            "Pipeline started"
        );

        Ok(handle)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every task of one pipeline
pub struct PipelineContext {
    config: PipelineConfig,
    registry: RwLock<StreamRegistry>,
    statuses: RwLock<BTreeMap<String, Arc<StreamStatus>>>,
    dedup: Deduplicator,
    queues: PriorityQueues,
    publisher: Publisher,
    credentials: Arc<dyn CredentialResolver>,
    push_transport: Arc<dyn Transport>,
    pull_transport: Arc<dyn Transport>,
    points_received: AtomicU64,
    points_processed: AtomicU64,
}

impl PipelineContext {
    pub(crate) fn new(
        config: PipelineConfig,
        publisher: Publisher,
        credentials: Arc<dyn CredentialResolver>,
        push_transport: Arc<dyn Transport>,
        pull_transport: Arc<dyn Transport>,
    ) -> Self {
        let dedup = Deduplicator::with_limits(
            config.freshness_window,
            config.hash_granularity,
            config.dedup_max_entries,
        );
        let queues = PriorityQueues::new(config.queue_capacity);

        Self {
            config,
            registry: RwLock::new(StreamRegistry::new()),
            statuses: RwLock::new(BTreeMap::new()),
            dedup,
            queues,
            publisher,
            credentials,
            push_transport,
            pull_transport,
            points_received: AtomicU64::new(0),
            points_processed: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: PipelineConfig) -> Self {
        let pull = HttpPollTransport::with_client(reqwest::Client::new());
        Self::new(
            config.clone(),
            Publisher::new(config.channel_prefix),
            Arc::new(NoCredentials),
            Arc::new(WebSocketTransport::new()),
            Arc::new(pull),
        )
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with_transport(config: PipelineConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            config.clone(),
            Publisher::new(config.channel_prefix),
            Arc::new(NoCredentials),
            Arc::clone(&transport),
            transport,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn queues(&self) -> &PriorityQueues {
        &self.queues
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub(crate) fn credentials(&self) -> &dyn CredentialResolver {
        self.credentials.as_ref()
    }

    pub(crate) fn transport(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Push => Arc::clone(&self.push_transport),
            TransportKind::Pull => Arc::clone(&self.pull_transport),
        }
    }

    pub(crate) fn record_received(&self, count: u64) {
        self.points_received.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.points_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Points parsed across all streams
    pub fn points_received(&self) -> u64 {
        self.points_received.load(Ordering::Relaxed)
    }

    /// Points fully published
    pub fn points_processed(&self) -> u64 {
        self.points_processed.load(Ordering::Relaxed)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<StreamDescriptor>> {
        self.registry.read().lookup(name)
    }

    pub fn list_active(&self) -> Vec<Arc<StreamDescriptor>> {
        self.registry.read().list_active()
    }

    /// Statuses of running streams, in name order
    pub fn stream_statuses(&self) -> Vec<Arc<StreamStatus>> {
        self.statuses.read().values().cloned().collect()
    }

    pub fn stream_status(&self, name: &str) -> Option<Arc<StreamStatus>> {
        self.statuses.read().get(name).cloned()
    }

    /// Build a metrics snapshot from current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let statuses = self.stream_statuses();

        MetricsSnapshot {
            timestamp: Utc::now(),
            points_received: self.points_received(),
            points_processed: self.points_processed(),
            points_deduplicated: self.dedup.duplicates(),
            queue_depths: self.queues.depths(),
            drop_counts: self.queues.drops(),
            active_connections: statuses
                .iter()
                .filter(|s| s.state() == StreamState::Connected)
                .count(),
            error_counts: statuses
                .iter()
                .map(|s| (s.name().to_string(), s.error_count()))
                .collect(),
            parse_errors: statuses.iter().map(|s| s.parse_errors()).sum(),
            publish_errors: self.publisher.error_count(),
            dedup_fail_open: self.dedup.fail_open_count(),
        }
    }

    /// Evaluate every stream now
    ///
    /// The sink is not probed here; the periodic monitor does that.
    pub fn health(&self) -> HealthReport {
        let thresholds = HealthThresholds::from_config(&self.config);
        HealthReport {
            timestamp: Utc::now(),
            streams: check_streams(&self.stream_statuses(), &thresholds),
            sink_healthy: None,
        }
    }
}

struct SupervisorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct RunState {
    shutting_down: bool,
    supervisors: HashMap<String, SupervisorHandle>,
    processors: Vec<JoinHandle<ProcessorReport>>,
    background: Vec<(&'static str, JoinHandle<()>)>,
    metrics_server: Option<JoinHandle<()>>,
}

/// Summary of a completed shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Points published during the whole run
    pub processed: u64,
    /// Points left in queues when the drain deadline passed
    pub discarded: usize,
    /// Tasks that had to be aborted
    pub aborted_tasks: usize,
    /// Tasks that panicked before they could be joined
    pub failed_tasks: usize,
    pub elapsed: Duration,
}

impl ShutdownReport {
    fn record<T>(&mut self, task: &str, exit: TaskExit<T>) -> Option<T> {
        match exit {
            TaskExit::Finished(value) => Some(value),
            TaskExit::Failed(e) => {
                error!(task, error = %e, "Task failed before shutdown");
                self.failed_tasks += 1;
                None
            }
            TaskExit::Aborted => {
                warn!(task, "Task did not stop in time, aborted");
                self.aborted_tasks += 1;
                None
            }
        }
    }
}

/// Runtime handle to a started pipeline
///
/// Dropping the handle without calling [`PipelineHandle::shutdown`] stops
/// every stream and aborts the metrics server. Processors still drain
/// their queues, but nothing waits for them.
pub struct PipelineHandle {
    ctx: Arc<PipelineContext>,
    state: Mutex<RunState>,
    shutdown_tx: watch::Sender<bool>,
    metrics_rx: watch::Receiver<Option<MetricsSnapshot>>,
}

impl PipelineHandle {
    /// Register a stream and start it if active
    ///
    /// # Errors
    /// `ShuttingDown` once shutdown has begun, otherwise whatever the
    /// registry rejects
    pub fn register(&self, descriptor: StreamDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(PipelineError::ShuttingDown);
        }

        let descriptor = self.ctx.registry.write().register(descriptor)?;
        if descriptor.active {
            self.spawn_supervisor(&mut state, descriptor);
        }
        Ok(())
    }

    /// Stop a stream and remove it from the registry
    pub async fn deregister(&self, name: &str) -> Result<()> {
        let supervisor = {
            let mut state = self.state.lock();
            self.ctx.registry.write().deregister(name)?;
            state.supervisors.remove(name)
        };

        if let Some(supervisor) = supervisor {
            let _ = supervisor.stop.send(true);
            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            match join_or_abort(deadline, supervisor.task).await {
                TaskExit::Finished(()) => {}
                TaskExit::Failed(e) => error!(stream = %name, error = %e, "Supervisor failed"),
                TaskExit::Aborted => warn!(stream = %name, "Supervisor did not stop in time, aborted"),
            }
        }

        self.ctx.statuses.write().remove(name);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<StreamDescriptor>> {
        self.ctx.lookup(name)
    }

    pub fn list_active(&self) -> Vec<Arc<StreamDescriptor>> {
        self.ctx.list_active()
    }

    /// Subscribe to a data type; takes effect for the next published point
    pub fn subscribe(&self, data_type: DataType, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        self.ctx.publisher.subscribe(data_type, subscriber)
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, data_type: DataType, id: SubscriptionId) -> bool {
        self.ctx.publisher.unsubscribe(data_type, id)
    }

    pub fn stream_status(&self, name: &str) -> Option<Arc<StreamStatus>> {
        self.ctx.stream_status(name)
    }

    pub fn health(&self) -> HealthReport {
        self.ctx.health()
    }

    /// Current counters, built on demand
    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.snapshot()
    }

    /// Snapshots as the periodic reporter publishes them
    pub fn metrics_updates(&self) -> watch::Receiver<Option<MetricsSnapshot>> {
        self.metrics_rx.clone()
    }

    /// Shared context, e.g. for serving it over HTTP
    pub fn context(&self) -> Arc<PipelineContext> {
        Arc::clone(&self.ctx)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Stop sources, drain queues within the shutdown timeout, stop the rest
    ///
    /// Bounded by `shutdown_timeout` plus a short grace period; tasks still
    /// running after that are aborted. Calling it again returns an empty
    /// report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();

        let (supervisors, processors, background, metrics_server) = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            (
                std::mem::take(&mut state.supervisors),
                std::mem::take(&mut state.processors),
                std::mem::take(&mut state.background),
                state.metrics_server.take(),
            )
        };

        info!(streams = supervisors.len(), "Pipeline shutting down");

        let deadline =
            tokio::time::Instant::now() + self.ctx.config.shutdown_timeout + STOP_GRACE;
        let mut report = ShutdownReport::default();

        // Sources first so nothing new reaches the queues
        for supervisor in supervisors.values() {
            let _ = supervisor.stop.send(true);
        }
        for (name, supervisor) in supervisors {
            let exit = join_or_abort(deadline, supervisor.task).await;
            report.record(&name, exit);
        }

        let _ = self.shutdown_tx.send(true);

        for processor in processors {
            let exit = join_or_abort(deadline, processor).await;
            if let Some(processor_report) = report.record("processor", exit) {
                report.processed += processor_report.processed;
                report.discarded += processor_report.discarded;
            }
        }

        // Left behind by aborted processors
        for priority in Priority::ALL {
            report.discarded += self.ctx.queues.queue(priority).clear();
        }

        for (name, task) in background {
            let exit = join_or_abort(deadline, task).await;
            report.record(name, exit);
        }

        if let Some(server) = metrics_server {
            server.abort();
        }

        if timeout_at(deadline, self.ctx.publisher.shutdown()).await.is_err() {
            warn!("Sink shutdown timed out");
        }

        report.elapsed = started.elapsed();
        info!(
            processed = report.processed,
            discarded = report.discarded,
            aborted_tasks = report.aborted_tasks,
            failed_tasks = report.failed_tasks,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Pipeline stopped"
        );
        report
    }

    fn spawn_supervisor(&self, state: &mut RunState, descriptor: Arc<StreamDescriptor>) {
        let name = descriptor.name.clone();
        let status = Arc::new(StreamStatus::new(name.clone(), descriptor.transport));
        self.ctx
            .statuses
            .write()
            .insert(name.clone(), Arc::clone(&status));

        let (stop, stop_rx) = watch::channel(false);
        let supervisor = Supervisor::new(Arc::clone(&self.ctx), descriptor, status);
        let task = tokio::spawn(supervisor.run(stop_rx));

        debug!(stream = %name, "Supervisor spawned");
        state.supervisors.insert(name, SupervisorHandle { stop, task });
    }
}

/// How a joined task ended
enum TaskExit<T> {
    Finished(T),
    /// Panicked or was cancelled
    Failed(JoinError),
    /// Still running at the deadline
    Aborted,
}

/// Wait for a task until `deadline`, aborting it afterwards
async fn join_or_abort<T>(deadline: tokio::time::Instant, mut task: JoinHandle<T>) -> TaskExit<T> {
    match timeout_at(deadline, &mut task).await {
        Ok(Ok(value)) => TaskExit::Finished(value),
        Ok(Err(e)) => TaskExit::Failed(e),
        Err(_) => {
            task.abort();
            TaskExit::Aborted
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(server) = state.metrics_server.take() {
            server.abort();
        }
        // Closing each stop channel ends its supervisor
        state.supervisors.clear();
    }
}
