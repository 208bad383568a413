//! Generic JSON parser
//!
//! Handles the common shape of polled and streamed JSON feeds: a single
//! object, an array of objects, or an object wrapping such an array under a
//! records key. Each object becomes one DataPoint.

use super::{ParseContext, Parser};
use crate::credentials::Credentials;
use crate::descriptor::StreamDescriptor;
use crate::error::SourceError;
use crate::point::{DataPoint, FieldValue, Payload};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value, json};

/// Parser for flat JSON records
///
/// - `symbol` key (configurable) becomes the point's symbol; a stream with a
///   single configured symbol lends it to records that carry none
/// - `timestamp` key (configurable) is read as RFC 3339 or epoch millis;
///   records without one are stamped with the receive time
/// - every other key lands in the payload
#[derive(Debug, Clone)]
pub struct JsonParser {
    symbol_key: String,
    timestamp_key: String,
    records_key: Option<String>,
    subscribe_on_connect: bool,
}

impl JsonParser {
    pub fn new() -> Self {
        Self {
            symbol_key: "symbol".to_string(),
            timestamp_key: "timestamp".to_string(),
            records_key: None,
            subscribe_on_connect: false,
        }
    }

    pub fn symbol_key(mut self, key: impl Into<String>) -> Self {
        self.symbol_key = key.into();
        self
    }

    pub fn timestamp_key(mut self, key: impl Into<String>) -> Self {
        self.timestamp_key = key.into();
        self
    }

    /// Read records from `{ "<key>": [ ... ] }` envelopes
    pub fn records_key(mut self, key: impl Into<String>) -> Self {
        self.records_key = Some(key.into());
        self
    }

    /// Send auth and subscribe frames when a push connection opens
    pub fn subscribe_on_connect(mut self) -> Self {
        self.subscribe_on_connect = true;
        self
    }

    fn records(&self, value: Value) -> Result<Vec<Map<String, Value>>, SourceError> {
        let value = match (&self.records_key, value) {
            (Some(key), Value::Object(mut envelope)) => envelope
                .remove(key)
                .ok_or_else(|| SourceError::Parse(format!("missing records key '{key}'")))?,
            (_, value) => value,
        };

        match value {
            Value::Object(record) => Ok(vec![record]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(record) => Ok(record),
                    other => Err(SourceError::Parse(format!(
                        "expected JSON object record, got {}",
                        kind(&other)
                    ))),
                })
                .collect(),
            other => Err(SourceError::Parse(format!(
                "expected JSON object or array, got {}",
                kind(&other)
            ))),
        }
    }

    fn to_point(
        &self,
        ctx: &ParseContext<'_>,
        mut record: Map<String, Value>,
    ) -> Result<DataPoint, SourceError> {
        let stream = ctx.stream;

        let symbol = match record.remove(&self.symbol_key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Null) | None => match stream.symbols.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            },
            Some(other) => {
                return Err(SourceError::Parse(format!(
                    "'{}' must be a string, got {}",
                    self.symbol_key,
                    kind(&other)
                )));
            }
        };

        let timestamp = match record.remove(&self.timestamp_key) {
            Some(value) => parse_timestamp(&value)?,
            None => ctx.received_at,
        };

        let payload: Payload = record
            .into_iter()
            .map(|(key, value)| (key, FieldValue::from_json(value)))
            .collect();

        Ok(DataPoint {
            source: stream.name.clone(),
            data_type: stream.data_type,
            symbol,
            timestamp,
            payload,
            priority: stream.priority,
        })
    }
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, ctx: &ParseContext<'_>, raw: &[u8]) -> Result<Vec<DataPoint>, SourceError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| SourceError::Parse(format!("invalid JSON: {e}")))?;

        self.records(value)?
            .into_iter()
            .map(|record| self.to_point(ctx, record))
            .collect()
    }

    fn handshake(
        &self,
        stream: &StreamDescriptor,
        credentials: Option<&Credentials>,
    ) -> Vec<String> {
        if !self.subscribe_on_connect {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(2);
        if let Some(credentials) = credentials {
            frames.push(json!({ "action": "auth", "params": credentials.token() }).to_string());
        }
        frames.push(json!({ "action": "subscribe", "params": stream.symbols.join(",") }).to_string());
        frames
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, SourceError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| SourceError::Parse(format!("bad timestamp '{s}': {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| SourceError::Parse(format!("bad epoch millis {n}"))),
        other => Err(SourceError::Parse(format!(
            "timestamp must be a string or number, got {}",
            kind(other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::point::{DataType, Priority};
    use std::sync::Arc;

    fn ticks() -> StreamDescriptor {
        StreamDescriptor::push(
            "ticks",
            DataType::MarketData,
            "wss://feed/ws",
            Arc::new(JsonParser::new()),
        )
        .symbols(["AAPL", "MSFT"])
        .priority(Priority::Critical)
    }

    fn parse(parser: &JsonParser, stream: &StreamDescriptor, raw: &str) -> Result<Vec<DataPoint>, SourceError> {
        let ctx = ParseContext {
            stream,
            received_at: Utc.timestamp_millis_opt(42_000).unwrap(),
        };
        parser.parse(&ctx, raw.as_bytes())
    }

    #[test]
    fn test_single_object() {
        let points = parse(
            &JsonParser::new(),
            &ticks(),
            r#"{"symbol":"AAPL","timestamp":"2024-03-01T14:30:00Z","price":180.5,"size":10}"#,
        )
        .unwrap();

        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.source, "ticks");
        assert_eq!(p.data_type, DataType::MarketData);
        assert_eq!(p.priority, Priority::Critical);
        assert_eq!(p.symbol.as_deref(), Some("AAPL"));
        assert_eq!(p.timestamp.to_rfc3339(), "2024-03-01T14:30:00+00:00");
        assert_eq!(p.payload.get("price"), Some(&FieldValue::Float(180.5)));
        assert_eq!(p.payload.get("size"), Some(&FieldValue::Int(10)));
        assert!(!p.payload.contains_key("symbol"));
    }

    #[test]
    fn test_array_with_epoch_millis() {
        let points = parse(
            &JsonParser::new(),
            &ticks(),
            r#"[{"symbol":"AAPL","timestamp":1000,"p":1},{"symbol":"MSFT","timestamp":2000,"p":2}]"#,
        )
        .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].timestamp.timestamp_millis(), 2000);
    }

    #[test]
    fn test_missing_timestamp_uses_receive_time() {
        let points = parse(&JsonParser::new(), &ticks(), r#"{"symbol":"AAPL"}"#).unwrap();
        assert_eq!(points[0].timestamp.timestamp_millis(), 42_000);
    }

    #[test]
    fn test_single_symbol_stream_lends_symbol() {
        let stream = ticks().symbols(["TSLA"]);
        let points = parse(&JsonParser::new(), &stream, r#"{"price":1}"#).unwrap();
        assert_eq!(points[0].symbol.as_deref(), Some("TSLA"));

        let points = parse(&JsonParser::new(), &ticks(), r#"{"price":1}"#).unwrap();
        assert_eq!(points[0].symbol, None);
    }

    #[test]
    fn test_records_envelope() {
        let parser = JsonParser::new().records_key("data");
        let points = parse(&parser, &ticks(), r#"{"data":[{"symbol":"AAPL"}],"status":"OK"}"#).unwrap();
        assert_eq!(points.len(), 1);

        assert!(parse(&parser, &ticks(), r#"{"status":"OK"}"#).is_err());
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        assert!(parse(&JsonParser::new(), &ticks(), "  \n").unwrap().is_empty());
        assert!(parse(&JsonParser::new(), &ticks(), "[]").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            parse(&JsonParser::new(), &ticks(), "not json"),
            Err(SourceError::Parse(_))
        ));
        assert!(parse(&JsonParser::new(), &ticks(), "[1,2]").is_err());
        assert!(parse(&JsonParser::new(), &ticks(), r#"{"timestamp":true}"#).is_err());
        assert!(parse(&JsonParser::new(), &ticks(), r#"{"symbol":7}"#).is_err());
    }

    #[test]
    fn test_handshake_frames() {
        let stream = ticks();
        assert!(JsonParser::new().handshake(&stream, None).is_empty());

        let parser = JsonParser::new().subscribe_on_connect();
        let creds = Credentials::new("secret");
        let frames = parser.handshake(&stream, Some(&creds));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("auth"));
        assert!(frames[0].contains("secret"));
        assert!(frames[1].contains("AAPL,MSFT"));
    }
}
