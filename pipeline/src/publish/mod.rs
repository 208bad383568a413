//! Publishing for TULVA
//!
//! Processors hand each dequeued point to the [`Publisher`], which fans it
//! out to every subscriber registered for the point's data type and, when
//! configured, to one external [`EventSink`] on channel
//! `{prefix}.{data_type}`.
//!
//! Subscribers run concurrently; an error or panic in one is logged and
//! counted without affecting the others or the processor.

mod stdout;
mod webhook;

pub use stdout::StdoutSink;
pub use webhook::WebhookSink;

use crate::error::SourceError;
use crate::metrics;
use crate::parse::panic_message;
use crate::point::{DataPoint, DataType, Payload, Priority};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};
use ulid::Ulid;

/// In-process consumer of data points
///
/// # Example
///
/// ```ignore
/// struct Signals { tx: mpsc::Sender<DataPoint> }
///
/// #[async_trait]
/// impl Subscriber for Signals {
///     fn name(&self) -> &str { "signals" }
///
///     async fn on_event(&self, point: &DataPoint) -> Result<(), SourceError> {
///         self.tx.send(point.clone()).await.map_err(|e| SourceError::Publish(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscriber name for logging and error counters
    fn name(&self) -> &str;

    /// Handle one point
    ///
    /// Slow handlers only delay the processor for this point's priority.
    async fn on_event(&self, point: &DataPoint) -> Result<(), SourceError>;
}

/// Subscriber from a synchronous closure
pub struct FnSubscriber<F> {
    name: String,
    f: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&DataPoint) -> Result<(), SourceError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&DataPoint) -> Result<(), SourceError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, point: &DataPoint) -> Result<(), SourceError> {
        (self.f)(point)
    }
}

/// Handle returned by [`Publisher::subscribe`], needed to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Ulid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire form of a point on an external channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub source: String,
    pub data_type: DataType,
    pub symbol: Option<String>,
    /// RFC 3339, UTC
    pub timestamp: String,
    pub priority: Priority,
    pub payload: Payload,
}

impl From<&DataPoint> for PublishedEvent {
    fn from(point: &DataPoint) -> Self {
        Self {
            source: point.source.clone(),
            data_type: point.data_type,
            symbol: point.symbol.clone(),
            timestamp: point
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            priority: point.priority,
            payload: point.payload.clone(),
        }
    }
}

/// External pub/sub sink
///
/// Receives every published point on its type's channel.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sink name for identification and logging
    fn name(&self) -> &'static str;

    /// Publish one event on a channel
    async fn publish(&self, channel: &str, event: &PublishedEvent) -> Result<(), SourceError>;

    /// Health check for the destination
    async fn health(&self) -> bool;

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Outcome of publishing one point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
    /// `None` when no sink is configured
    pub sink_ok: Option<bool>,
}

type SubscriberList = Vec<(SubscriptionId, Arc<dyn Subscriber>)>;

/// Fan-out to subscribers and the external sink
pub struct Publisher {
    subscribers: RwLock<HashMap<DataType, SubscriberList>>,
    sink: Option<Arc<dyn EventSink>>,
    channel_prefix: String,
    published: AtomicU64,
    subscriber_errors: AtomicU64,
    sink_errors: AtomicU64,
}

impl Publisher {
    pub fn new(channel_prefix: impl Into<String>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            sink: None,
            channel_prefix: channel_prefix.into(),
            published: AtomicU64::new(0),
            subscriber_errors: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Register a subscriber for one data type
    pub fn subscribe(&self, data_type: DataType, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId::new();
        debug!(data_type = %data_type, subscriber = subscriber.name(), id = %id, "Subscribed");
        self.subscribers
            .write()
            .entry(data_type)
            .or_default()
            .push((id, subscriber));
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, data_type: DataType, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&data_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&data_type);
        }
        if removed {
            debug!(data_type = %data_type, id = %id, "Unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, data_type: DataType) -> usize {
        self.subscribers
            .read()
            .get(&data_type)
            .map_or(0, Vec::len)
    }

    /// External channel name for a data type
    pub fn channel_for(&self, data_type: DataType) -> String {
        format!("{}.{}", self.channel_prefix, data_type.as_str())
    }

    /// Deliver one point to its subscribers and the sink
    ///
    /// Never fails: every error is logged and counted here.
    pub async fn publish(&self, point: &DataPoint) -> PublishReport {
        // Snapshot so (un)subscribe never waits on a slow handler
        let targets: Vec<Arc<dyn Subscriber>> = self
            .subscribers
            .read()
            .get(&point.data_type)
            .map(|list| list.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();

        let calls: Vec<_> = targets
            .into_iter()
            .map(|subscriber| async move {
                let outcome = AssertUnwindSafe(subscriber.on_event(point))
                    .catch_unwind()
                    .await;
                (subscriber, outcome)
            })
            .collect();

        let mut report = PublishReport::default();

        for (subscriber, outcome) in join_all(calls).await {
            let name = subscriber.name();
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    self.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::try_record_publish_error(name);
                    warn!(
                        subscriber = name,
                        data_type = %point.data_type,
                        source = %point.source,
                        error = %e,
                        "Subscriber failed"
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    self.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::try_record_publish_error(name);
                    error!(
                        subscriber = name,
                        data_type = %point.data_type,
                        panic = %panic_message(panic.as_ref()),
                        "Subscriber panicked"
                    );
                }
            }
        }

        if let Some(sink) = &self.sink {
            let channel = self.channel_for(point.data_type);
            let event = PublishedEvent::from(point);
            match sink.publish(&channel, &event).await {
                Ok(()) => report.sink_ok = Some(true),
                Err(e) => {
                    report.sink_ok = Some(false);
                    self.sink_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::try_record_publish_error(sink.name());
                    warn!(sink = sink.name(), channel = %channel, error = %e, "Sink publish failed");
                }
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        report
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Points published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Subscriber plus sink failures
    pub fn error_count(&self) -> u64 {
        self.subscriber_errors.load(Ordering::Relaxed) + self.sink_errors.load(Ordering::Relaxed)
    }

    pub async fn sink_health(&self) -> Option<bool> {
        match &self.sink {
            Some(sink) => Some(sink.health().await),
            None => None,
        }
    }

    /// Let the sink flush and close
    pub async fn shutdown(&self) {
        if let Some(sink) = &self.sink
            && let Err(e) = sink.shutdown().await
        {
            warn!(sink = sink.name(), error = %e, "Sink shutdown failed");
        }
    }
}
