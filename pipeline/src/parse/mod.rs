//! Parser adapters for TULVA
//!
//! Parsers decode the raw payloads of one source into canonical DataPoints.
//! Each stream descriptor carries the parser that understands its format.
//!
//! Parsers are pure: they never touch pipeline state and never block.
//! The supervisor calls them through [`parse_guarded`], so an error or a
//! panic inside a parser only costs the message that triggered it.

mod json;

pub use json::JsonParser;

use crate::credentials::Credentials;
use crate::descriptor::StreamDescriptor;
use crate::error::SourceError;
use crate::point::DataPoint;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Context handed to a parser alongside the raw bytes
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// The stream the payload arrived on
    pub stream: &'a StreamDescriptor,
    /// When the transport received the payload
    pub received_at: DateTime<Utc>,
}

/// Parser trait - decodes raw source bytes into DataPoints
///
/// # Example
///
/// ```ignore
/// struct QuoteParser;
///
/// impl Parser for QuoteParser {
///     fn name(&self) -> &'static str { "quotes" }
///
///     fn parse(&self, ctx: &ParseContext<'_>, raw: &[u8]) -> Result<Vec<DataPoint>, SourceError> {
///         let quotes: Vec<Quote> = serde_json::from_slice(raw)?;
///         Ok(quotes.into_iter().map(|q| q.into_point(ctx)).collect())
///     }
/// }
/// ```
pub trait Parser: Send + Sync {
    /// Parser name for identification and logging
    fn name(&self) -> &'static str;

    /// Decode one raw message into zero or more DataPoints
    fn parse(&self, ctx: &ParseContext<'_>, raw: &[u8]) -> Result<Vec<DataPoint>, SourceError>;

    /// Frames to send right after a push connection opens
    ///
    /// Credentials are only valid for the connection being opened.
    fn handshake(
        &self,
        _stream: &StreamDescriptor,
        _credentials: Option<&Credentials>,
    ) -> Vec<String> {
        Vec::new()
    }
}

/// Invoke a parser, turning panics into `SourceError::Parse`
pub fn parse_guarded(
    parser: &dyn Parser,
    ctx: &ParseContext<'_>,
    raw: &[u8],
) -> Result<Vec<DataPoint>, SourceError> {
    match catch_unwind(AssertUnwindSafe(|| parser.parse(ctx, raw))) {
        Ok(result) => result,
        Err(panic) => Err(SourceError::Parse(format!(
            "parser '{}' panicked: {}",
            parser.name(),
            panic_message(panic.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::point::{DataType, Priority};
    use std::sync::Arc;
    use std::time::Duration;

    struct PanickingParser;

    impl Parser for PanickingParser {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn parse(&self, _ctx: &ParseContext<'_>, _raw: &[u8]) -> Result<Vec<DataPoint>, SourceError> {
            panic!("vendor changed the schema again");
        }
    }

    struct FailingParser;

    impl Parser for FailingParser {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn parse(&self, _ctx: &ParseContext<'_>, _raw: &[u8]) -> Result<Vec<DataPoint>, SourceError> {
            Err(SourceError::Parse("truncated frame".into()))
        }
    }

    fn stream() -> StreamDescriptor {
        StreamDescriptor::pull(
            "test",
            DataType::News,
            "http://localhost/news",
            Duration::from_secs(1),
            Arc::new(JsonParser::new()),
        )
        .priority(Priority::Low)
    }

    #[test]
    fn test_panic_becomes_parse_error() {
        let stream = stream();
        let ctx = ParseContext {
            stream: &stream,
            received_at: Utc::now(),
        };

        let result = parse_guarded(&PanickingParser, &ctx, b"{}");
        match result {
            Err(SourceError::Parse(msg)) => {
                assert!(msg.contains("panicky"));
                assert!(msg.contains("schema"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_passes_through() {
        let stream = stream();
        let ctx = ParseContext {
            stream: &stream,
            received_at: Utc::now(),
        };
        assert!(matches!(
            parse_guarded(&FailingParser, &ctx, b""),
            Err(SourceError::Parse(_))
        ));
    }

    #[test]
    fn test_default_handshake_is_empty() {
        let stream = stream();
        assert!(FailingParser.handshake(&stream, None).is_empty());
    }
}
