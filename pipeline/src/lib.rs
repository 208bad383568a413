//! TULVA - Real-time Multi-source Ingestion Pipeline
//!
//! Supervises many external data streams (WebSocket push and HTTP pull),
//! normalizes their payloads into canonical [`DataPoint`]s, drops
//! duplicates inside a freshness window, queues points by priority, and
//! fans them out to in-process subscribers and an optional external sink.
//!
//! # Architecture
//!
//! ```text
//! Streams ──► Supervisor ──► Parser ──► Dedup ──► PriorityQueues ──► Processors ──► Publisher
//!  (push/pull)  (backoff)                                              (per priority)   ├─► Subscribers
//!                                                                                       └─► EventSink
//! ```
//!
//! Sources, parsers, credential providers, subscribers and sinks are all
//! pluggable via traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod janitor;
pub mod metrics;
pub mod metrics_server;
pub mod parse;
pub mod pipeline;
pub mod point;
pub mod processor;
pub mod publish;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use config::{LogFormat, PipelineConfig, QueueCapacities};
pub use credentials::{CredentialResolver, Credentials, EnvCredentials, NoCredentials};
pub use descriptor::{StreamDescriptor, TransportKind};
pub use error::{PipelineError, Result, SourceError};
pub use health::HealthReport;
pub use metrics::MetricsSnapshot;
pub use parse::{JsonParser, ParseContext, Parser};
pub use pipeline::{Pipeline, PipelineContext, PipelineHandle, ShutdownReport};
pub use point::{DataPoint, DataType, FieldValue, HashKey, Payload, Priority};
pub use publish::{
    EventSink, FnSubscriber, PublishedEvent, StdoutSink, Subscriber, SubscriptionId, WebhookSink,
};
pub use supervisor::{StreamState, StreamStatus};
pub use telemetry::init_tracing;
pub use transport::{HttpPollTransport, Link, RawMessage, Transport, WebSocketTransport};
