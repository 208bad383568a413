//! Stream descriptors - configuration for one external source

use crate::error::{PipelineError, Result};
use crate::parse::Parser;
use crate::point::{DataType, Priority};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How a stream receives data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent connection, the remote pushes messages (WebSocket)
    Push,
    /// Periodic request on `update_frequency` (HTTP GET)
    Pull,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Push => "push",
            TransportKind::Pull => "pull",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one external source
///
/// Immutable once registered: the registry hands out `Arc<StreamDescriptor>`
/// and changes require deregistering and registering again.
///
/// # Example
///
/// ```ignore
/// let ticks = StreamDescriptor::push("ticks", DataType::MarketData, "wss://feed/ws", parser)
///     .symbols(["AAPL", "MSFT"])
///     .priority(Priority::Critical);
/// ```
#[derive(Clone)]
pub struct StreamDescriptor {
    /// Unique key within the registry
    pub name: String,
    pub data_type: DataType,
    pub endpoint: String,
    pub symbols: Vec<String>,
    /// Only meaningful for `TransportKind::Pull`
    pub update_frequency: Duration,
    pub priority: Priority,
    pub transport: TransportKind,
    pub parser: Arc<dyn Parser>,
    pub active: bool,
}

impl StreamDescriptor {
    /// Describe a push (WebSocket) stream
    pub fn push(
        name: impl Into<String>,
        data_type: DataType,
        endpoint: impl Into<String>,
        parser: Arc<dyn Parser>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            endpoint: endpoint.into(),
            symbols: Vec::new(),
            update_frequency: Duration::ZERO,
            priority: Priority::Medium,
            transport: TransportKind::Push,
            parser,
            active: true,
        }
    }

    /// Describe a pull (HTTP polling) stream
    pub fn pull(
        name: impl Into<String>,
        data_type: DataType,
        endpoint: impl Into<String>,
        update_frequency: Duration,
        parser: Arc<dyn Parser>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            endpoint: endpoint.into(),
            symbols: Vec::new(),
            update_frequency,
            priority: Priority::Medium,
            transport: TransportKind::Pull,
            parser,
            active: true,
        }
    }

    pub fn symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Check required fields
    ///
    /// Fails with `InvalidDescriptor` when the name or endpoint is empty, the
    /// endpoint scheme does not match the transport, a pull stream has no
    /// period, or a symbol-scoped data type lists no symbols.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::invalid(&self.name, "name is empty"));
        }

        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(PipelineError::invalid(&self.name, "endpoint is empty"));
        }

        let schemes: &[&str] = match self.transport {
            TransportKind::Push => &["ws://", "wss://"],
            TransportKind::Pull => &["http://", "https://"],
        };
        if !schemes.iter().any(|s| endpoint.starts_with(s)) {
            return Err(PipelineError::invalid(
                &self.name,
                format!(
                    "{} transport needs a {} endpoint, got '{}'",
                    self.transport,
                    schemes.join(" or "),
                    endpoint
                ),
            ));
        }

        if self.transport == TransportKind::Pull && self.update_frequency.is_zero() {
            return Err(PipelineError::invalid(
                &self.name,
                "pull stream needs a positive update frequency",
            ));
        }

        if self.data_type.is_symbol_scoped() && self.symbols.is_empty() {
            return Err(PipelineError::invalid(
                &self.name,
                format!("{} streams need at least one symbol", self.data_type),
            ));
        }

        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(PipelineError::invalid(&self.name, "symbol list has a blank entry"));
        }

        Ok(())
    }
}

impl fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("endpoint", &self.endpoint)
            .field("symbols", &self.symbols)
            .field("update_frequency", &self.update_frequency)
            .field("priority", &self.priority)
            .field("transport", &self.transport)
            .field("parser", &self.parser.name())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parse::JsonParser;

    fn parser() -> Arc<dyn Parser> {
        Arc::new(JsonParser::new())
    }

    #[test]
    fn test_valid_push_descriptor() {
        let desc = StreamDescriptor::push("ticks", DataType::MarketData, "wss://feed/ws", parser())
            .symbols(["AAPL"])
            .priority(Priority::Critical);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.transport, TransportKind::Push);
        assert!(desc.active);
    }

    #[test]
    fn test_valid_pull_descriptor_without_symbols() {
        let desc = StreamDescriptor::pull(
            "headlines",
            DataType::News,
            "https://news/api",
            Duration::from_secs(30),
            parser(),
        );
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_missing_endpoint() {
        let desc = StreamDescriptor::pull("x", DataType::News, " ", Duration::from_secs(1), parser());
        assert!(matches!(
            desc.validate(),
            Err(PipelineError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_symbol_scoped_type_needs_symbols() {
        let desc = StreamDescriptor::push("ticks", DataType::OptionsFlow, "wss://feed", parser());
        let err = desc.validate().unwrap_err();
        assert!(err.to_string().contains("at least one symbol"));
    }

    #[test]
    fn test_scheme_must_match_transport() {
        let desc = StreamDescriptor::push("ticks", DataType::News, "https://feed", parser());
        assert!(desc.validate().is_err());

        let desc = StreamDescriptor::pull(
            "poll",
            DataType::News,
            "wss://feed",
            Duration::from_secs(1),
            parser(),
        );
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_pull_needs_frequency() {
        let desc = StreamDescriptor::pull("poll", DataType::News, "http://x", Duration::ZERO, parser());
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_debug_shows_parser_name() {
        let desc = StreamDescriptor::push("ticks", DataType::News, "ws://x", parser());
        assert!(format!("{desc:?}").contains("json"));
    }
}
