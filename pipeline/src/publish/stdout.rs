//! Stdout sink for debugging
//!
//! Prints published events in a human-readable format.

use super::{EventSink, PublishedEvent};
use crate::error::SourceError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stdout sink - prints events for debugging
pub struct StdoutSink {
    /// Pretty print events
    pretty: bool,
    /// Count of events printed
    emitted_count: AtomicU64,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            pretty: false,
            emitted_count: AtomicU64::new(0),
        }
    }

    /// Create a new StdoutSink with pretty printing
    pub fn pretty() -> Self {
        Self {
            pretty: true,
            emitted_count: AtomicU64::new(0),
        }
    }

    /// Get total events printed
    pub fn emitted_count(&self) -> u64 {
        self.emitted_count.load(Ordering::Relaxed)
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn publish(&self, channel: &str, event: &PublishedEvent) -> Result<(), SourceError> {
        use std::io::Write;

        let mut stdout = std::io::stdout().lock();

        if self.pretty {
            writeln!(stdout, "┌─ {channel} ─────────────────────────────────────").ok();
            writeln!(stdout, "│ Source:    {}", event.source).ok();
            if let Some(symbol) = &event.symbol {
                writeln!(stdout, "│ Symbol:    {symbol}").ok();
            }
            writeln!(stdout, "│ Timestamp: {}", event.timestamp).ok();
            writeln!(stdout, "│ Priority:  {}", event.priority).ok();
            writeln!(stdout, "│ Payload:   {}", serde_json::to_string(&event.payload)?).ok();
            writeln!(stdout, "└─────────────────────────────────────────────────").ok();
        } else {
            writeln!(stdout, "[{channel}] {}", serde_json::to_string(event)?).ok();
        }

        self.emitted_count.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::point::{DataType, Payload, Priority};

    fn event() -> PublishedEvent {
        PublishedEvent {
            source: "headlines".into(),
            data_type: DataType::News,
            symbol: None,
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            priority: Priority::Low,
            payload: Payload::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_counts() {
        let sink = StdoutSink::new();
        sink.publish("tulva.news", &event()).await.unwrap();
        StdoutSink::pretty().publish("tulva.news", &event()).await.unwrap();

        assert_eq!(sink.emitted_count(), 1);
    }

    #[tokio::test]
    async fn test_health() {
        assert!(StdoutSink::new().health().await);
    }
}
