//! Push transport over WebSocket

use super::{Link, Transport};
use crate::error::SourceError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// Default connect timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Persistent WebSocket connection, one raw message per text/binary frame
pub struct WebSocketTransport {
    connect_timeout: Duration,
    /// Treat a silent connection as dead after this long
    read_timeout: Option<Duration>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: None,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reconnect when no frame (data or ping) arrives within `timeout`
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn run<'a>(&self, link: Link<'a>) -> Result<(), SourceError> {
        let stream = link.stream;

        let (mut socket, response) = timeout(self.connect_timeout, connect_async(stream.endpoint.as_str()))
            .await
            .map_err(|_| {
                SourceError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    stream.endpoint, self.connect_timeout
                ))
            })??;

        info!(
            stream = %stream.name,
            endpoint = %stream.endpoint,
            status = %response.status(),
            "WebSocket connected"
        );

        for frame in stream.parser.handshake(stream, link.credentials.as_ref()) {
            debug!(stream = %stream.name, bytes = frame.len(), "Sending handshake frame");
            socket.send(Message::Text(frame.into())).await?;
        }

        link.status.record_success();

        loop {
            let next = match self.read_timeout {
                Some(limit) => timeout(limit, socket.next()).await.map_err(|_| {
                    SourceError::Connection(format!("no frames for {limit:?}"))
                })?,
                None => socket.next().await,
            };

            let payload = match next {
                Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => Bytes::from(data),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Err(SourceError::Closed(match frame {
                        Some(frame) => format!("server sent close {}: {}", frame.code, frame.reason.as_str()),
                        None => "server sent close".to_string(),
                    }));
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SourceError::Closed("stream ended".to_string())),
            };

            if !link.forward(payload).await {
                debug!(stream = %stream.name, "Raw channel closed, leaving connection");
                let _ = socket.close(None).await;
                return Ok(());
            }
        }
    }
}
