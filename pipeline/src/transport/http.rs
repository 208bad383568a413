//! Pull transport over HTTP polling

use super::{Link, Transport};
use crate::error::SourceError;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Issues one GET per `update_frequency`; each response body is one raw message
///
/// Symbols are sent as a comma-separated `symbols` query parameter and
/// credentials as a bearer token.
pub struct HttpPollTransport {
    client: Client,
    headers: HashMap<String, String>,
}

impl HttpPollTransport {
    /// Create a poller with default timeouts (30s request, 10s connect)
    ///
    /// # Errors
    /// Returns `SourceError::Connection` if the HTTP client cannot be created
    pub fn new() -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SourceError::Connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            headers: HashMap::new(),
        })
    }

    /// Use a preconfigured client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            headers: HashMap::new(),
        }
    }

    /// Add a custom header to all requests
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    async fn fetch(&self, link: &Link<'_>) -> Result<bytes::Bytes, SourceError> {
        let stream = link.stream;
        let mut request = self.client.get(&stream.endpoint);

        if !stream.symbols.is_empty() {
            request = request.query(&[("symbols", stream.symbols.join(","))]);
        }
        if let Some(credentials) = &link.credentials {
            request = request.bearer_auth(credentials.token());
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            SourceError::Connection(format!("request to {} failed: {e}", stream.endpoint))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Connection(format!(
                "{} returned {status}: {body}",
                stream.endpoint
            )));
        }

        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl Transport for HttpPollTransport {
    fn name(&self) -> &'static str {
        "http-poll"
    }

    async fn run<'a>(&self, link: Link<'a>) -> Result<(), SourceError> {
        let mut ticker = interval(link.stream.update_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // After a failure the backoff has already been waited; the next
        // request still waits a full period on top of it.
        if link.status.consecutive_failures() > 0 {
            ticker.tick().await;
        }

        loop {
            ticker.tick().await;

            let body = self.fetch(&link).await?;
            link.status.record_success();

            debug!(stream = %link.stream.name, bytes = body.len(), "Poll succeeded");

            if !link.forward(body).await {
                return Ok(());
            }
        }
    }
}
