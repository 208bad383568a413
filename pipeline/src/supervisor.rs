//! Per-stream supervision
//!
//! Each active stream runs in one task with two halves joined together:
//!
//! ```text
//! connection loop                          ingest loop
//! ┌──────────────────────────────┐         ┌─────────────────────────────┐
//! │ resolve credentials          │  raw    │ parse (panic-guarded)       │
//! │ Transport::run ──────────────┼──chan──►│ dedup                       │
//! │ on Err: backoff, retry       │         │ enqueue by priority         │
//! └──────────────────────────────┘         └─────────────────────────────┘
//! ```
//!
//! A failing or slow stream only ever affects its own task. Parse errors are
//! counted and skipped; connection errors back off and retry forever until
//! the stream is stopped.

use crate::backoff::BackoffConfig;
use crate::descriptor::{StreamDescriptor, TransportKind};
use crate::dedup::Admission;
use crate::error::SourceError;
use crate::metrics;
use crate::parse::{ParseContext, parse_guarded};
use crate::pipeline::{PipelineContext, stop_requested};
use crate::transport::{Link, RawMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Connection state of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    /// Supervisor has exited
    Stopped,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connecting => "connecting",
            StreamState::Connected => "connected",
            StreamState::Stopped => "stopped",
        }
    }
}

struct StateCell {
    state: StreamState,
    since: Instant,
    /// Start of the current outage; cleared only by a successful connect
    down_since: Option<Instant>,
    last_error: Option<String>,
}

impl StateCell {
    fn transition(&mut self, state: StreamState) {
        if self.state == state {
            return;
        }
        let now = Instant::now();
        match state {
            StreamState::Connected => self.down_since = None,
            _ => {
                self.down_since.get_or_insert(now);
            }
        }
        self.state = state;
        self.since = now;
    }
}

/// Live status of one stream, shared between its supervisor, the health
/// monitor and the metrics reporter
pub struct StreamStatus {
    name: String,
    transport: TransportKind,
    cell: Mutex<StateCell>,
    consecutive_failures: AtomicU32,
    connection_errors: AtomicU64,
    parse_errors: AtomicU64,
    messages_received: AtomicU64,
    points_received: AtomicU64,
    duplicates: AtomicU64,
    degraded: AtomicBool,
}

impl StreamStatus {
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            cell: Mutex::new(StateCell {
                state: StreamState::Disconnected,
                since: Instant::now(),
                down_since: Some(Instant::now()),
                last_error: None,
            }),
            consecutive_failures: AtomicU32::new(0),
            connection_errors: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            points_received: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn state(&self) -> StreamState {
        self.cell.lock().state
    }

    /// How long the stream has been in its current state
    pub fn time_in_state(&self) -> Duration {
        self.cell.lock().since.elapsed()
    }

    /// How long the stream has been without a usable connection, across
    /// reconnect attempts; `None` while connected
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.cell.lock().down_since.map(|since| since.elapsed())
    }

    pub fn set_state(&self, state: StreamState) {
        self.cell.lock().transition(state);
    }

    /// Connection is usable again: reset the failure streak
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_state(StreamState::Connected);
    }

    /// Connection attempt failed; returns the new failure streak
    pub fn record_failure(&self, error: &SourceError) -> u32 {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        {
            let mut cell = self.cell.lock();
            cell.last_error = Some(error.to_string());
            cell.transition(StreamState::Disconnected);
        }
        self.consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    pub fn record_parse_error(&self, error: &SourceError) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.cell.lock().last_error = Some(error.to_string());
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Accumulated connection and parse errors
    pub fn error_count(&self) -> u64 {
        self.connection_errors() + self.parse_errors()
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn points_received(&self) -> u64 {
        self.points_received.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Set the degraded flag; returns the previous value
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.degraded.swap(degraded, Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.cell.lock().last_error.clone()
    }
}

/// Runs one stream until its stop signal fires
pub(crate) struct Supervisor {
    ctx: Arc<PipelineContext>,
    stream: Arc<StreamDescriptor>,
    status: Arc<StreamStatus>,
    backoff: BackoffConfig,
}

impl Supervisor {
    pub(crate) fn new(
        ctx: Arc<PipelineContext>,
        stream: Arc<StreamDescriptor>,
        status: Arc<StreamStatus>,
    ) -> Self {
        let backoff = BackoffConfig::new(ctx.config().backoff_base, ctx.config().backoff_cap);
        Self {
            ctx,
            stream,
            status,
            backoff,
        }
    }

    /// Run both halves until `stop` flips to true
    ///
    /// The ingest loop drains whatever the transport already buffered before
    /// the task ends.
    pub(crate) async fn run(self, stop: watch::Receiver<bool>) {
        let (raw_tx, raw_rx) = mpsc::channel(self.ctx.config().raw_channel_capacity);

        info!(
            stream = %self.stream.name,
            transport = %self.stream.transport,
            endpoint = %self.stream.endpoint,
            "Stream supervisor starting"
        );

        tokio::join!(self.connection_loop(raw_tx, stop), self.ingest_loop(raw_rx));

        self.status.set_state(StreamState::Stopped);
        info!(stream = %self.stream.name, "Stream supervisor stopped");
    }

    async fn connection_loop(&self, raw_tx: mpsc::Sender<RawMessage>, mut stop: watch::Receiver<bool>) {
        let transport = self.ctx.transport(self.stream.transport);

        loop {
            if *stop.borrow() {
                break;
            }

            self.status.set_state(StreamState::Connecting);

            let result = match self.ctx.credentials().resolve(self.stream.as_ref()).await {
                Ok(credentials) => {
                    let link = Link {
                        stream: self.stream.as_ref(),
                        credentials,
                        raw_tx: &raw_tx,
                        status: self.status.as_ref(),
                    };
                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut stop) => break,
                        result = transport.run(link) => result,
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    debug!(stream = %self.stream.name, "Ingest side closed");
                    break;
                }
                Err(e) => {
                    let failures = self.status.record_failure(&e);
                    metrics::try_record_connection_error(&self.stream.name);

                    let delay = self.backoff.delay(failures);
                    warn!(
                        stream = %self.stream.name,
                        transport = transport.name(),
                        error = %e,
                        failures = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Stream connection failed"
                    );

                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut stop) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        // raw_tx drops here, letting the ingest loop finish
    }

    async fn ingest_loop(&self, mut raw_rx: mpsc::Receiver<RawMessage>) {
        while let Some(raw) = raw_rx.recv().await {
            self.ingest(&raw);
        }
    }

    /// Parse one raw message and push its points through dedup into the queues
    fn ingest(&self, raw: &RawMessage) {
        let ctx = ParseContext {
            stream: self.stream.as_ref(),
            received_at: raw.received_at,
        };

        let points = match parse_guarded(self.stream.parser.as_ref(), &ctx, &raw.payload) {
            Ok(points) => points,
            Err(e) => {
                self.status.record_parse_error(&e);
                metrics::try_record_parse_error(&self.stream.name);
                warn!(
                    stream = %self.stream.name,
                    parser = self.stream.parser.name(),
                    bytes = raw.payload.len(),
                    error = %e,
                    "Failed to parse payload"
                );
                return;
            }
        };

        if points.is_empty() {
            return;
        }

        let count = points.len() as u64;
        self.status.points_received.fetch_add(count, Ordering::Relaxed);
        self.ctx.record_received(count);
        metrics::try_record_received(&self.stream.name, count);

        for point in points {
            match self.ctx.dedup().admit(&point) {
                Admission::Duplicate => {
                    self.status.duplicates.fetch_add(1, Ordering::Relaxed);
                    metrics::try_record_duplicate(&self.stream.name);
                    debug!(stream = %self.stream.name, symbol = ?point.symbol, "Duplicate dropped");
                }
                Admission::Accepted => {
                    self.ctx.queues().enqueue(point);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::parse::JsonParser;
    use crate::point::{DataType, Priority};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Sends its script on each attempt, then fails or idles
    struct ScriptedTransport {
        payloads: Vec<&'static str>,
        fail_after: bool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run<'a>(&self, link: Link<'a>) -> Result<(), SourceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            link.status.record_success();
            for payload in &self.payloads {
                if !link.forward(*payload).await {
                    return Ok(());
                }
            }
            if self.fail_after {
                return Err(SourceError::Closed("scripted close".into()));
            }
            std::future::pending().await
        }
    }

    fn context(transport: Arc<dyn Transport>) -> Arc<PipelineContext> {
        let config = PipelineConfig {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            ..PipelineConfig::default()
        };
        Arc::new(PipelineContext::for_tests_with_transport(config, transport))
    }

    fn stream() -> Arc<StreamDescriptor> {
        Arc::new(
            StreamDescriptor::push("ticks", DataType::MarketData, "ws://feed", Arc::new(JsonParser::new()))
                .symbols(["AAPL"])
                .priority(Priority::High),
        )
    }

    async fn run_for(ctx: &Arc<PipelineContext>, wait: Duration) -> Arc<StreamStatus> {
        let status = Arc::new(StreamStatus::new("ticks", TransportKind::Push));
        let supervisor = Supervisor::new(Arc::clone(ctx), stream(), Arc::clone(&status));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(stop_rx));

        tokio::time::sleep(wait).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("supervisor should stop promptly")
            .unwrap();
        status
    }

    #[tokio::test]
    async fn test_ingest_dedups_and_enqueues() {
        let transport = Arc::new(ScriptedTransport {
            payloads: vec![
                r#"{"symbol":"AAPL","timestamp":1700000000000,"price":1.0}"#,
                r#"{"symbol":"AAPL","timestamp":1700000000000,"price":1.0}"#,
                r#"{"symbol":"AAPL","timestamp":1700000001000,"price":2.0}"#,
            ],
            fail_after: false,
            attempts: AtomicUsize::new(0),
        });
        let ctx = context(transport);

        let status = run_for(&ctx, Duration::from_millis(100)).await;

        assert_eq!(status.messages_received(), 3);
        assert_eq!(status.points_received(), 3);
        assert_eq!(status.duplicates(), 1);
        assert_eq!(ctx.queues().queue(Priority::High).len(), 2);
        assert_eq!(status.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_parse_errors_do_not_stop_stream() {
        let transport = Arc::new(ScriptedTransport {
            payloads: vec![
                "not json",
                r#"{"symbol":"AAPL","timestamp":1700000000000,"price":1.0}"#,
            ],
            fail_after: false,
            attempts: AtomicUsize::new(0),
        });
        let ctx = context(transport);

        let status = run_for(&ctx, Duration::from_millis(100)).await;

        assert_eq!(status.parse_errors(), 1);
        assert_eq!(status.connection_errors(), 0);
        assert_eq!(ctx.queues().total_len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let transport = Arc::new(ScriptedTransport {
            payloads: vec![],
            fail_after: true,
            attempts: AtomicUsize::new(0),
        });
        let ctx = context(Arc::clone(&transport) as Arc<dyn Transport>);

        let status = run_for(&ctx, Duration::from_millis(200)).await;

        let attempts = transport.attempts.load(Ordering::SeqCst);
        assert!(attempts >= 3, "expected several reconnects, got {attempts}");
        assert!(status.connection_errors() >= 2);
        assert!(status.last_error().unwrap().contains("scripted close"));
    }

    #[test]
    fn test_status_failure_streak() {
        let status = StreamStatus::new("s", TransportKind::Pull);
        assert_eq!(status.state(), StreamState::Disconnected);

        status.record_success();
        assert_eq!(status.state(), StreamState::Connected);

        let err = SourceError::Connection("refused".into());
        assert_eq!(status.record_failure(&err), 1);
        assert_eq!(status.record_failure(&err), 2);
        assert_eq!(status.state(), StreamState::Disconnected);

        status.record_success();
        assert_eq!(status.consecutive_failures(), 0);
        assert_eq!(status.connection_errors(), 2);
        assert_eq!(status.error_count(), 2);
    }

    #[test]
    fn test_outage_spans_reconnect_attempts() {
        let status = StreamStatus::new("s", TransportKind::Push);
        assert!(status.disconnected_for().is_some());

        status.record_success();
        assert!(status.disconnected_for().is_none());

        let err = SourceError::Closed("eof".into());
        status.record_failure(&err);
        std::thread::sleep(Duration::from_millis(20));
        status.set_state(StreamState::Connecting);
        status.record_failure(&err);

        assert!(status.disconnected_for().unwrap() >= Duration::from_millis(20));
        assert!(status.time_in_state() < Duration::from_millis(20));
    }
}
