//! The canonical DataPoint and its tagged variants
//!
//! Every parser turns raw payloads into `DataPoint`s. The point's
//! [`HashKey`] is a pure function of source, symbol, rounded timestamp and
//! payload, so two parsers seeing the same record produce the same key.
//!
//! ```text
//! source ─┐
//! symbol ─┼──► blake3 ──► HashKey (32 bytes)
//! ts/g   ─┤
//! payload ┘ (canonical, key-ordered)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Kind of information a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    MarketData,
    News,
    SocialMedia,
    Patents,
    Research,
    EconomicIndicators,
    InsiderTrading,
    OptionsFlow,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::MarketData,
        DataType::News,
        DataType::SocialMedia,
        DataType::Patents,
        DataType::Research,
        DataType::EconomicIndicators,
        DataType::InsiderTrading,
        DataType::OptionsFlow,
    ];

    /// Stable snake_case name, used for channel names and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::MarketData => "market_data",
            DataType::News => "news",
            DataType::SocialMedia => "social_media",
            DataType::Patents => "patents",
            DataType::Research => "research",
            DataType::EconomicIndicators => "economic_indicators",
            DataType::InsiderTrading => "insider_trading",
            DataType::OptionsFlow => "options_flow",
        }
    }

    /// Whether points of this type are meaningless without a symbol
    pub fn is_symbol_scoped(&self) -> bool {
        match self {
            DataType::MarketData | DataType::InsiderTrading | DataType::OptionsFlow => true,
            DataType::News
            | DataType::SocialMedia
            | DataType::Patents
            | DataType::Research
            | DataType::EconomicIndicators => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority; selects the queue and latency target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities, most urgent first
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Dense index for per-priority arrays
    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Convert a JSON value; nested arrays and objects are kept as JSON text
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => FieldValue::Text(s),
            nested @ (Value::Array(_) | Value::Object(_)) => FieldValue::Text(nested.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn feed(&self, hasher: &mut blake3::Hasher) {
        match self {
            FieldValue::Null => {
                hasher.update(&[0]);
            }
            FieldValue::Bool(b) => {
                hasher.update(&[1, u8::from(*b)]);
            }
            FieldValue::Int(i) => {
                hasher.update(&[2]);
                hasher.update(&i.to_le_bytes());
            }
            FieldValue::Float(f) => {
                hasher.update(&[3]);
                hasher.update(&f.to_bits().to_le_bytes());
            }
            FieldValue::Text(s) => {
                hasher.update(&[4]);
                hasher.update(&(s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// Ordered payload map; ordering makes the hash canonical
pub type Payload = BTreeMap<String, FieldValue>;

/// Deterministic identity of a DataPoint
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey([u8; 32]);

impl HashKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({self})")
    }
}

/// Canonical normalized ingestion event
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use tulva_pipeline::point::{DataPoint, DataType, Priority};
///
/// let point = DataPoint::new("alpaca-ticks", DataType::MarketData, Priority::Critical, Utc::now())
///     .with_symbol("AAPL")
///     .with_field("price", 187.25);
/// assert_eq!(point.symbol.as_deref(), Some("AAPL"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Name of the originating stream
    pub source: String,

    pub data_type: DataType,

    pub symbol: Option<String>,

    pub timestamp: DateTime<Utc>,

    pub payload: Payload,

    pub priority: Priority,
}

impl DataPoint {
    pub fn new(
        source: impl Into<String>,
        data_type: DataType,
        priority: Priority,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            data_type,
            symbol: None,
            timestamp,
            payload: Payload::new(),
            priority,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Derive the dedup key
    ///
    /// The timestamp is rounded down to `granularity` first, so records that
    /// only differ below the granularity collapse onto the same key.
    pub fn hash_key(&self, granularity: Duration) -> HashKey {
        let mut hasher = blake3::Hasher::new();

        hasher.update(&(self.source.len() as u64).to_le_bytes());
        hasher.update(self.source.as_bytes());

        match &self.symbol {
            Some(symbol) => {
                hasher.update(&[1]);
                hasher.update(&(symbol.len() as u64).to_le_bytes());
                hasher.update(symbol.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }

        hasher.update(&round_millis(&self.timestamp, granularity).to_le_bytes());
        hasher.update(self.payload_digest().as_bytes());

        HashKey(*hasher.finalize().as_bytes())
    }

    /// Digest of the payload alone
    pub fn payload_digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in &self.payload {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            value.feed(&mut hasher);
        }
        hasher.finalize()
    }
}

/// Epoch milliseconds rounded down to a multiple of `granularity`
fn round_millis(timestamp: &DateTime<Utc>, granularity: Duration) -> i64 {
    let millis = timestamp.timestamp_millis();
    let step = i64::try_from(granularity.as_millis()).unwrap_or(i64::MAX).max(1);
    millis.div_euclid(step) * step
}
