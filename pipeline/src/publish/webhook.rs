//! HTTP webhook sink
//!
//! POSTs each event as JSON to `{base_url}/{channel}`.
//!
//! # Example
//!
//! ```ignore
//! let sink = WebhookSink::new("https://bus.internal/publish")?
//!     .header("Authorization", "Bearer token123");
//! let pipeline = Pipeline::new().sink(Arc::new(sink));
//! ```

use super::{EventSink, PublishedEvent};
use crate::error::SourceError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

/// Body sent per request
#[derive(Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    event: &'a PublishedEvent,
}

/// HTTP webhook sink - one POST per event
pub struct WebhookSink {
    client: Client,
    base_url: String,
    health_url: Option<String>,
    headers: HashMap<String, String>,
}

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

impl WebhookSink {
    /// Create a sink posting under `base_url`
    ///
    /// Uses default timeouts: 30s request timeout, 10s connection timeout
    ///
    /// # Errors
    /// Returns `SourceError::Connection` if the HTTP client cannot be created
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SourceError::Connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_url: None,
            headers: HashMap::new(),
        })
    }

    /// Set a custom health check URL
    ///
    /// By default, health checks use HEAD request to the base URL.
    pub fn health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    /// Add a custom header to all requests
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn url_for(&self, channel: &str) -> String {
        format!("{}/{}", self.base_url, channel)
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn publish(&self, channel: &str, event: &PublishedEvent) -> Result<(), SourceError> {
        let url = self.url_for(channel);
        let mut request = self
            .client
            .post(&url)
            .json(&WebhookPayload { channel, event });

        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                if response.status().is_success() {
                    debug!(url = %url, status = %response.status(), "Webhook delivered");
                    Ok(())
                } else {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    error!(url = %url, status = %status, body = %body, "Webhook request failed");
                    Err(SourceError::Publish(format!("Webhook returned {status}: {body}")))
                }
            }
            Err(e) => {
                error!(url = %url, error = %e, "Webhook connection failed");
                Err(SourceError::Connection(format!(
                    "Failed to connect to {url}: {e}"
                )))
            }
        }
    }

    async fn health(&self) -> bool {
        let url = self.health_url.as_ref().unwrap_or(&self.base_url);

        match self.client.head(url).send().await {
            Ok(response) => {
                // Reachable unless the server itself errors
                let healthy = !response.status().is_server_error();
                if !healthy {
                    debug!(url = %url, status = %response.status(), "Health check returned server error");
                }
                healthy
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}
