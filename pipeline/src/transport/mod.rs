//! Transports for TULVA
//!
//! A transport owns one connection attempt for one stream: it connects,
//! forwards raw payloads into the stream's raw channel, and returns when the
//! connection fails. Reconnecting and backoff belong to the supervisor.
//!
//! ```text
//! Supervisor ──► Transport::run(link) ──► raw channel ──► parse ──► dedup ──► queue
//!     ▲                │
//!     └── backoff ◄────┘ Err(SourceError)
//! ```

mod http;
mod websocket;

pub use http::HttpPollTransport;
pub use websocket::WebSocketTransport;

use crate::credentials::Credentials;
use crate::descriptor::StreamDescriptor;
use crate::error::SourceError;
use crate::supervisor::StreamStatus;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// One raw payload as received from a source
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Stamp a payload with the current time
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Everything a transport needs for one connection attempt
pub struct Link<'a> {
    pub stream: &'a StreamDescriptor,
    /// Valid for this attempt only
    pub credentials: Option<Credentials>,
    pub raw_tx: &'a mpsc::Sender<RawMessage>,
    pub status: &'a StreamStatus,
}

impl Link<'_> {
    /// Forward a payload to the ingest loop
    ///
    /// Returns `false` once the ingest side has gone away.
    pub async fn forward(&self, payload: impl Into<Bytes>) -> bool {
        self.status.record_message();
        self.raw_tx.send(RawMessage::new(payload)).await.is_ok()
    }
}

/// Transport trait - runs one connection until it fails
///
/// Implementations must:
/// - call `link.status.record_success()` once the connection is usable
///   (push) or after every successful request (pull)
/// - return `Err` on any connection failure so the supervisor can back off
/// - return `Ok(())` only when the raw channel has closed
///
/// Cancellation is by dropping the future; the supervisor does this on
/// shutdown or deregistration.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for identification and logging
    fn name(&self) -> &'static str;

    /// Run until the connection fails or the raw channel closes
    async fn run<'a>(&self, link: Link<'a>) -> Result<(), SourceError>;
}
